//! Streaming relay of upstream bodies
//!
//! The relay is a pull-based stream: hyper polls it only as fast as the
//! client reads, and polling it is what reads from the upstream socket. When
//! the client goes away hyper drops the body, which drops the relay, which
//! drops the upstream response and closes that connection.

use axum::http::{header, HeaderMap};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

/// Comment frame sent while an event stream is idle.
pub const HEARTBEAT_FRAME: &[u8] = b": ping\n\n";

/// Envelope for the trailing error emitted when the upstream breaks mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFraming {
    EventStream,
    Ndjson,
    Json,
}

impl ErrorFraming {
    /// Pick the envelope from the client's `Accept` header.
    pub fn from_accept(headers: &HeaderMap) -> Self {
        let accept = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",")
            .to_ascii_lowercase();

        if accept.contains("text/event-stream") {
            ErrorFraming::EventStream
        } else if accept.contains("application/x-ndjson")
            || accept.contains("application/ndjson")
            || accept.contains("application/jsonl")
        {
            ErrorFraming::Ndjson
        } else {
            ErrorFraming::Json
        }
    }
}

/// Render the trailing error frame.
///
/// `tail` is the last byte already sent to the client, used to make sure the
/// frame starts on a line of its own.
pub fn stream_error_frame(framing: ErrorFraming, message: &str, tail: Option<u8>) -> Bytes {
    let payload = json!({
        "error": {
            "type": "stream_error",
            "message": message,
        }
    })
    .to_string();

    let mid_line = matches!(tail, Some(b) if b != b'\n');

    let frame = match framing {
        ErrorFraming::EventStream => {
            let sep = if mid_line { "\n\n" } else { "" };
            format!("{}data: {}\n\n", sep, payload)
        }
        ErrorFraming::Ndjson => {
            let sep = if mid_line { "\n" } else { "" };
            format!("{}{}\n", sep, payload)
        }
        ErrorFraming::Json => payload,
    };
    Bytes::from(frame)
}

/// Last bytes relayed so far, kept across chunk boundaries.
#[derive(Debug, Default)]
struct Tail {
    bytes: [u8; 4],
    len: usize,
}

impl Tail {
    fn push(&mut self, chunk: &[u8]) {
        for &b in chunk.iter().rev().take(4).rev() {
            if self.len == 4 {
                self.bytes.copy_within(1.., 0);
                self.len = 3;
            }
            self.bytes[self.len] = b;
            self.len += 1;
        }
    }

    fn last(&self) -> Option<u8> {
        self.len.checked_sub(1).map(|i| self.bytes[i])
    }

    /// Nothing relayed yet, or the last event was terminated by a blank line.
    fn at_event_boundary(&self) -> bool {
        let tail = &self.bytes[..self.len];
        tail.is_empty() || tail.ends_with(b"\n\n") || tail.ends_with(b"\r\n\r\n") || tail.ends_with(b"\r\r")
    }
}

/// Logs when the client stops reading before the upstream finished.
pub struct RelayGuard {
    trace_id: String,
    endpoint: String,
    completed: bool,
}

impl RelayGuard {
    pub fn new(trace_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            endpoint: endpoint.into(),
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::info!(
                "[{}] Client disconnected, cancelling upstream stream from {}",
                self.trace_id,
                self.endpoint
            );
        }
    }
}

/// Relay `upstream` chunk by chunk.
///
/// With `heartbeat` set, a `: ping` comment is emitted whenever the upstream
/// is silent for that long and the bytes sent so far end on an event
/// boundary. A transport error ends the stream with one
/// [`stream_error_frame`].
pub fn relay<S, E>(
    upstream: S,
    framing: ErrorFraming,
    heartbeat: Option<Duration>,
    guard: RelayGuard,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut guard = guard;
        let mut upstream = Box::pin(upstream);
        let mut tail = Tail::default();

        loop {
            let next = match heartbeat {
                Some(every) => match tokio::time::timeout(every, upstream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if tail.at_event_boundary() {
                            tracing::debug!("[{}] Upstream idle, sending heartbeat", guard.trace_id);
                            yield Ok(Bytes::from_static(HEARTBEAT_FRAME));
                        }
                        continue;
                    }
                },
                None => upstream.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    tail.push(&chunk);
                    yield Ok(chunk);
                }
                Some(Err(e)) => {
                    tracing::warn!("[{}] Upstream stream from {} interrupted: {}", guard.trace_id, guard.endpoint, e);
                    guard.complete();
                    yield Ok(stream_error_frame(framing, &e.to_string(), tail.last()));
                    break;
                }
                None => {
                    guard.complete();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::ACCEPT, HeaderValue::from_static(value));
        h
    }

    async fn collect<S>(stream: S) -> Vec<u8>
    where
        S: Stream<Item = Result<Bytes, Infallible>>,
    {
        let mut out = Vec::new();
        futures::pin_mut!(stream);
        while let Some(Ok(chunk)) = stream.next().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_framing_from_accept() {
        assert_eq!(ErrorFraming::from_accept(&accept("text/event-stream")), ErrorFraming::EventStream);
        assert_eq!(
            ErrorFraming::from_accept(&accept("application/json, text/event-stream;q=0.9")),
            ErrorFraming::EventStream
        );
        assert_eq!(ErrorFraming::from_accept(&accept("application/x-ndjson")), ErrorFraming::Ndjson);
        assert_eq!(ErrorFraming::from_accept(&accept("application/json")), ErrorFraming::Json);
        assert_eq!(ErrorFraming::from_accept(&HeaderMap::new()), ErrorFraming::Json);
    }

    #[test]
    fn test_error_frames() {
        let sse = stream_error_frame(ErrorFraming::EventStream, "boom", None);
        let sse = std::str::from_utf8(&sse).unwrap();
        let data = sse.strip_prefix("data: ").unwrap().strip_suffix("\n\n").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(parsed["error"]["type"], "stream_error");

        let json = stream_error_frame(ErrorFraming::Json, "boom", Some(b'}'));
        let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed["error"]["type"], "stream_error");
        assert_eq!(parsed["error"]["message"], "boom");

        let ndjson = stream_error_frame(ErrorFraming::Ndjson, "boom", Some(b'}'));
        assert!(ndjson.starts_with(b"\n{"));
        assert!(ndjson.ends_with(b"}\n"));

        let sse_mid = stream_error_frame(ErrorFraming::EventStream, "boom", Some(b'x'));
        assert!(sse_mid.starts_with(b"\n\ndata: "));
    }

    #[tokio::test]
    async fn test_relay_passes_chunks_in_order() {
        let upstream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("data: 1\n\n")),
            Ok(Bytes::from("data: 2\n\n")),
        ]);
        let out = collect(relay(upstream, ErrorFraming::EventStream, None, RelayGuard::new("t", "e"))).await;
        assert_eq!(out, b"data: 1\n\ndata: 2\n\n");
    }

    #[tokio::test]
    async fn test_relay_appends_single_error_frame() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from("{\"partial\":")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from("never sent")),
        ]);
        let out = collect(relay(upstream, ErrorFraming::Json, None, RelayGuard::new("t", "e"))).await;
        let text = String::from_utf8(out).unwrap();

        let trailer = text.strip_prefix("{\"partial\":").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(trailer).unwrap();
        assert_eq!(parsed["error"]["type"], "stream_error");
        assert!(!text.contains("never sent"));
        assert!(!text.contains("data:"));
    }

    #[test]
    fn test_tail_tracks_bytes_across_chunks() {
        let mut tail = Tail::default();
        assert!(tail.at_event_boundary());
        assert_eq!(tail.last(), None);

        tail.push(b"data: 1\n");
        assert!(!tail.at_event_boundary());
        tail.push(b"\n");
        assert!(tail.at_event_boundary());
        assert_eq!(tail.last(), Some(b'\n'));

        tail.push(b"data: 2\r\n");
        assert!(!tail.at_event_boundary());
        tail.push(b"\r");
        tail.push(b"\n");
        assert!(tail.at_event_boundary());

        tail.push(b"x");
        assert!(!tail.at_event_boundary());
        assert_eq!(tail.last(), Some(b'x'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_crlf_event() {
        let upstream = async_stream::stream! {
            yield Ok::<_, std::io::Error>(Bytes::from("data: 1\r\n\r\n"));
            tokio::time::sleep(Duration::from_secs(30)).await;
            yield Ok(Bytes::from("data: 2\r\n\r\n"));
        };
        let out = collect(relay(
            upstream,
            ErrorFraming::EventStream,
            Some(Duration::from_secs(25)),
            RelayGuard::new("t", "e"),
        ))
        .await;
        assert_eq!(out, b"data: 1\r\n\r\n: ping\n\ndata: 2\r\n\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_boundary_split_across_chunks() {
        let upstream = async_stream::stream! {
            yield Ok::<_, std::io::Error>(Bytes::from("data: 1\n"));
            yield Ok(Bytes::from("\n"));
            tokio::time::sleep(Duration::from_secs(30)).await;
            yield Ok(Bytes::from("data: 2\n\n"));
        };
        let out = collect(relay(
            upstream,
            ErrorFraming::EventStream,
            Some(Duration::from_secs(25)),
            RelayGuard::new("t", "e"),
        ))
        .await;
        assert_eq!(out, b"data: 1\n\n: ping\n\ndata: 2\n\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_between_events() {
        let upstream = async_stream::stream! {
            yield Ok::<_, std::io::Error>(Bytes::from("data: 1\n\n"));
            tokio::time::sleep(Duration::from_secs(30)).await;
            yield Ok(Bytes::from("data: par"));
            tokio::time::sleep(Duration::from_secs(30)).await;
            yield Ok(Bytes::from("tial\n\n"));
        };
        let out = collect(relay(
            upstream,
            ErrorFraming::EventStream,
            Some(Duration::from_secs(25)),
            RelayGuard::new("t", "e"),
        ))
        .await;
        assert_eq!(out, b"data: 1\n\n: ping\n\ndata: partial\n\n");
    }
}
