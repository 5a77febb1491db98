#![allow(dead_code)]

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;

pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .try_init();
}

/// Bytes that sniff as binary audio, not text.
pub fn audio_bytes(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i * 13 % 256) as u8).collect();
    if len >= 3 {
        data[..3].copy_from_slice(b"ID3");
    }
    data
}

/// Serve `body` at `/track` and an HTML error page at `/broken` on an ephemeral port.
pub async fn spawn_origin(body: Vec<u8>) -> SocketAddr {
    let app = Router::new()
        .route(
            "/track",
            get(move || {
                let body = body.clone();
                async move { ([("content-type", "audio/mpeg")], body) }
            }),
        )
        .route(
            "/broken",
            get(|| async { ([("content-type", "text/html")], "<html>sign in</html>") }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
