//! Streaming relay and mid-stream upstream failure.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{app, body_bytes, config, provider, send};
use futures::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// What a raw upstream does after sending its first chunk.
enum AfterChunk {
    /// Close without the terminating chunk.
    Close,
    /// Keep the connection open and send nothing more.
    Stall,
    /// Keep reading until the peer closes, then signal.
    WatchClose(oneshot::Sender<()>),
}

/// One-shot upstream that sends response headers and `chunk` as a chunked
/// body, then behaves as `after` says.
async fn raw_upstream(content_type: &'static str, chunk: &'static str, after: AfterChunk) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = socket.read(&mut tmp).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(end) = find_header_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + length {
                    break;
                }
            }
        }

        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
            content_type,
            chunk.len(),
            chunk
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();

        match after {
            AfterChunk::Close => {}
            AfterChunk::Stall => {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            AfterChunk::WatchClose(closed) => {
                loop {
                    match socket.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                let _ = closed.send(());
            }
        }
    });

    format!("http://{}", addr)
}

async fn truncating_upstream(content_type: &'static str, chunk: &'static str) -> String {
    raw_upstream(content_type, chunk, AfterChunk::Close).await
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[tokio::test]
async fn test_event_stream_is_relayed() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: 1\n\ndata: 2\n\n", "text/event-stream"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let uri = upstream.uri();
    let (app, _) = app(&config(vec![provider(&[(uri.as_str(), "k")])])).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"m","stream":true}"#))
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "text/event-stream");
    assert_eq!(body_bytes(response).await, b"data: 1\n\ndata: 2\n\n");
}

#[tokio::test]
async fn test_mid_stream_failure_appends_one_json_error() {
    let upstream = truncating_upstream("application/json", "{\"partial\":").await;
    let (app, _) = app(&config(vec![provider(&[(upstream.as_str(), "k")])])).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("accept", "application/json")
        .body(Body::from(r#"{"stream":true}"#))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let trailer = text.strip_prefix("{\"partial\":").unwrap();
    let error: serde_json::Value = serde_json::from_str(trailer).unwrap();
    assert_eq!(error["error"]["type"], "stream_error");
    assert_eq!(text.matches("stream_error").count(), 1);
}

#[tokio::test]
async fn test_mid_stream_failure_uses_event_stream_framing() {
    let upstream = truncating_upstream("text/event-stream", "data: 1\n\n").await;
    let (app, _) = app(&config(vec![provider(&[(upstream.as_str(), "k")])])).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("accept", "text/event-stream")
        .body(Body::from("{}"))
        .unwrap();
    let response = send(&app, request).await;

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let frame = text.strip_prefix("data: 1\n\n").unwrap();
    let data = frame.strip_prefix("data: ").unwrap().strip_suffix("\n\n").unwrap();
    let error: serde_json::Value = serde_json::from_str(data).unwrap();
    assert_eq!(error["error"]["type"], "stream_error");
}

#[tokio::test]
async fn test_client_disconnect_closes_upstream_connection() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let upstream = raw_upstream("text/event-stream", "data: 1\n\n", AfterChunk::WatchClose(closed_tx)).await;
    let (app, _) = app(&config(vec![provider(&[(upstream.as_str(), "k")])])).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("accept", "text/event-stream")
        .body(Body::from("{}"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut received = Vec::new();
    while !received.ends_with(b"data: 1\n\n") {
        let chunk = body.next().await.unwrap().unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"data: 1\n\n");

    // Client goes away mid-stream
    drop(body);

    let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx).await;
    assert!(matches!(closed, Ok(Ok(()))), "upstream connection still open after client disconnect");
}

#[tokio::test]
async fn test_stream_deadline_ends_with_one_ndjson_error_line() {
    let upstream = raw_upstream("application/x-ndjson", "{\"a\":1}\n", AfterChunk::Stall).await;
    let mut cfg = config(vec![provider(&[(upstream.as_str(), "k")])]);
    cfg.timeouts.stream_timeout = 2;
    let (app, _) = app(&cfg).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("accept", "application/x-ndjson")
        .body(Body::from(r#"{"stream":true}"#))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = tokio::time::timeout(Duration::from_secs(10), body_bytes(response))
        .await
        .expect("stream deadline did not end the response");
    let text = String::from_utf8(bytes).unwrap();

    let trailer = text.strip_prefix("{\"a\":1}\n").unwrap();
    assert!(trailer.ends_with('\n'));
    assert_eq!(trailer.lines().count(), 1);

    let error: serde_json::Value = serde_json::from_str(trailer.trim_end()).unwrap();
    assert_eq!(error["error"]["type"], "stream_error");
}
