//! Static IP blocklist, re-read periodically from a JSON file

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::proxy::client_ip;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub struct Blocklist {
    path: Option<PathBuf>,
    entries: RwLock<HashSet<String>>,
}

impl Blocklist {
    /// A blocklist that never blocks.
    pub fn empty() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashSet::new()),
        }
    }

    /// Load `path` once. A missing or malformed file yields an empty list.
    pub async fn load(path: PathBuf) -> Self {
        let list = Self {
            path: Some(path),
            entries: RwLock::new(HashSet::new()),
        };
        list.reload().await;
        list
    }

    pub fn contains(&self, identity: &str) -> bool {
        match self.entries.read() {
            Ok(entries) => entries.contains(identity),
            Err(poisoned) => poisoned.into_inner().contains(identity),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the file. On failure the previous entries are kept.
    pub async fn reload(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };

        match read_entries(path).await {
            Ok(entries) => {
                let count = entries.len();
                match self.entries.write() {
                    Ok(mut current) => *current = entries,
                    Err(poisoned) => *poisoned.into_inner() = entries,
                }
                tracing::debug!("Blocklist {:?} loaded with {} entr(ies)", path, count);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to load blocklist {:?}: {}", path, e);
                false
            }
        }
    }

    /// Re-read the file every `every` until the handle is aborted.
    pub fn spawn_refresher(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        self.path.as_ref()?;
        let list = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                list.reload().await;
            }
        }))
    }
}

async fn read_entries(path: &Path) -> anyhow::Result<HashSet<String>> {
    let content = tokio::fs::read_to_string(path).await?;
    let raw: Vec<String> = serde_json::from_str(&content)?;
    Ok(raw
        .iter()
        .map(|entry| client_ip::normalize(entry).unwrap_or_else(|| entry.trim().to_string()))
        .filter(|entry| !entry.is_empty())
        .collect())
}
