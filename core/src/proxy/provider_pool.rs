//! Provider pool with per-provider round-robin endpoint rotation

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ProviderConfig;
use crate::error::ProxyError;

/// One concrete (address, credential) pair backing a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct Provider {
    endpoints: Vec<Endpoint>,
}

impl Provider {
    /// Returns `None` for an empty endpoint list.
    pub fn new(endpoints: Vec<Endpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            None
        } else {
            Some(Self { endpoints })
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Public view of a provider. Credentials are never included.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderInfo {
    pub index: usize,
    pub endpoint_count: usize,
    pub endpoints: Vec<String>,
}

pub struct ProviderPool {
    providers: Vec<Provider>,
    cursors: Vec<AtomicUsize>,
}

impl ProviderPool {
    pub fn new(providers: Vec<Provider>) -> Self {
        let cursors = providers.iter().map(|_| AtomicUsize::new(0)).collect();
        Self { providers, cursors }
    }

    pub fn from_config(configs: &[ProviderConfig]) -> anyhow::Result<Self> {
        let mut providers = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let endpoints = config
                .endpoints
                .iter()
                .map(|e| Endpoint {
                    base_url: e.base_url.trim().trim_end_matches('/').to_string(),
                    api_key: e.api_key.trim().to_string(),
                })
                .collect();
            let provider = Provider::new(endpoints)
                .ok_or_else(|| anyhow::anyhow!("Provider {} has no endpoints", index))?;
            providers.push(provider);
        }
        if providers.is_empty() {
            anyhow::bail!("Provider pool is empty");
        }
        Ok(Self::new(providers))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider(&self, index: usize) -> Result<&Provider, ProxyError> {
        self.providers.get(index).ok_or(ProxyError::InvalidProvider {
            index,
            count: self.providers.len(),
        })
    }

    /// All endpoints of `index`, starting at the rotation cursor and wrapping.
    ///
    /// The cursor advances by one on every call, whatever the outcome of the
    /// request, so the first choice cycles with period `N`.
    pub fn next_candidates(&self, index: usize) -> Result<Vec<Endpoint>, ProxyError> {
        let provider = self.provider(index)?;
        let total = provider.len();
        let start = self.cursors[index].fetch_add(1, Ordering::Relaxed) % total;

        Ok((0..total)
            .map(|offset| provider.endpoints[(start + offset) % total].clone())
            .collect())
    }

    pub fn info(&self, index: usize) -> Result<ProviderInfo, ProxyError> {
        let provider = self.provider(index)?;
        Ok(ProviderInfo {
            index,
            endpoint_count: provider.len(),
            endpoints: provider.endpoints.iter().map(|e| e.base_url.clone()).collect(),
        })
    }

    pub fn all_info(&self) -> Vec<ProviderInfo> {
        (0..self.providers.len())
            .filter_map(|i| self.info(i).ok())
            .collect()
    }
}

/// The process-wide active provider index.
///
/// Owned by the router; only `get` and `compare_and_set` are exposed so a
/// switch can never store an index the caller did not validate against.
#[derive(Debug)]
pub struct ActiveProvider {
    index: AtomicUsize,
}

impl ActiveProvider {
    pub fn new(index: usize) -> Self {
        Self {
            index: AtomicUsize::new(index),
        }
    }

    pub fn get(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Store `new` if the current value is `current`. Returns whether it did.
    pub fn compare_and_set(&self, current: usize, new: usize) -> bool {
        self.index
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn endpoint(n: usize) -> Endpoint {
        Endpoint {
            base_url: format!("https://api{}.example.com", n),
            api_key: format!("key-{}", n),
        }
    }

    fn pool(sizes: &[usize]) -> ProviderPool {
        ProviderPool::new(
            sizes
                .iter()
                .map(|&n| Provider::new((0..n).map(endpoint).collect()).unwrap())
                .collect(),
        )
    }

    #[test]
    fn test_first_choice_cycles_with_period_n() {
        let pool = pool(&[3]);

        let firsts: Vec<Endpoint> = (0..3)
            .map(|_| pool.next_candidates(0).unwrap()[0].clone())
            .collect();
        let distinct: HashSet<_> = firsts.iter().map(|e| e.base_url.clone()).collect();
        assert_eq!(distinct.len(), 3);

        // Period 3: the fourth call starts where the first did
        assert_eq!(pool.next_candidates(0).unwrap()[0], firsts[0]);
    }

    #[test]
    fn test_candidates_cover_every_endpoint_in_rotation_order() {
        let pool = pool(&[3]);
        pool.next_candidates(0).unwrap();

        let candidates = pool.next_candidates(0).unwrap();
        assert_eq!(candidates, vec![endpoint(1), endpoint(2), endpoint(0)]);
    }

    #[test]
    fn test_single_endpoint_provider() {
        let pool = pool(&[1]);
        for _ in 0..5 {
            assert_eq!(pool.next_candidates(0).unwrap(), vec![endpoint(0)]);
        }
    }

    #[test]
    fn test_cursors_are_per_provider() {
        let pool = pool(&[2, 2]);
        pool.next_candidates(0).unwrap();
        assert_eq!(pool.next_candidates(1).unwrap()[0], endpoint(0));
        assert_eq!(pool.next_candidates(0).unwrap()[0], endpoint(1));
    }

    #[test]
    fn test_invalid_provider() {
        let pool = pool(&[1, 1]);
        match pool.next_candidates(2) {
            Err(ProxyError::InvalidProvider { index, count }) => {
                assert_eq!(index, 2);
                assert_eq!(count, 2);
            }
            other => panic!("expected InvalidProvider, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_selection_stays_even() {
        let pool = Arc::new(pool(&[4]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| pool.next_candidates(0).unwrap()[0].base_url.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for h in handles {
            for url in h.join().unwrap() {
                *counts.entry(url).or_insert(0) += 1;
            }
        }
        // fetch_add hands out each cursor value exactly once
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 100));
    }

    #[test]
    fn test_empty_provider_rejected() {
        assert!(Provider::new(vec![]).is_none());
    }

    #[test]
    fn test_from_config_trims_trailing_slash() {
        let configs = vec![ProviderConfig {
            endpoints: vec![crate::config::EndpointConfig {
                base_url: "https://api.example.com/ ".into(),
                api_key: " k ".into(),
            }],
        }];
        let pool = ProviderPool::from_config(&configs).unwrap();
        assert_eq!(
            pool.next_candidates(0).unwrap(),
            vec![Endpoint {
                base_url: "https://api.example.com".into(),
                api_key: "k".into(),
            }]
        );
        assert!(ProviderPool::from_config(&[]).is_err());
    }

    #[test]
    fn test_info_hides_credentials() {
        let pool = pool(&[2]);
        let info = pool.info(0).unwrap();
        assert_eq!(info.endpoint_count, 2);
        assert_eq!(info.endpoints, vec!["https://api0.example.com", "https://api1.example.com"]);
        let json = serde_json::to_string(&pool.all_info()).unwrap();
        assert!(!json.contains("key-0"));
    }

    #[test]
    fn test_active_provider_compare_and_set() {
        let active = ActiveProvider::new(0);
        assert!(active.compare_and_set(0, 2));
        assert_eq!(active.get(), 2);
        assert!(!active.compare_and_set(0, 1));
        assert_eq!(active.get(), 2);
    }
}
