//! Status endpoint queries against a canned HTTPS server.

mod common;

use common::tls_acceptor;
use passage_client::{StatusError, StatusRequest, Tunnel, TunnelConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn spawn_status_server(
    status_line: &'static str,
    body: &'static str,
) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = tls_acceptor();
    let (head_tx, head_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let head_tx = head_tx.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(tcp).await else {
                    return;
                };

                let mut head = Vec::new();
                let mut buf = vec![0u8; 2048];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = head_tx.send(head);

                let response = format!(
                    "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (port, head_rx)
}

fn tunnel() -> Tunnel {
    let config = TunnelConfig::builder()
        .local_address("localhost")
        .local_port(3000)
        .remote_address("127.0.0.1")
        .remote_port(443)
        .private_key([1u8; 32])
        .build()
        .unwrap();
    Tunnel::new(config).unwrap()
}

#[tokio::test]
async fn test_status_ok_returns_parsed_body() {
    let (port, mut heads) = spawn_status_server("HTTP/1.1 200 OK", r#"{"alias":"foo"}"#).await;
    let tunnel = tunnel();

    let info = tunnel
        .query_proxy_info(Some(StatusRequest {
            port: Some(port),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(info["alias"], "foo");

    // The request targets /<tunnel-id> and asks for JSON.
    let head = String::from_utf8(heads.recv().await.unwrap()).unwrap();
    assert!(head.starts_with(&format!("GET /{} HTTP/1.1\r\n", tunnel.id())));
    assert!(head.contains("Accept: application/json\r\n"));
}

#[tokio::test]
async fn test_status_error_carries_body_message() {
    let (port, _heads) =
        spawn_status_server("HTTP/1.1 404 Not Found", r#"{"message":"unknown"}"#).await;

    let err = tunnel()
        .query_proxy_info(Some(StatusRequest {
            port: Some(port),
            ..Default::default()
        }))
        .await
        .unwrap_err();

    match err {
        StatusError::Endpoint { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "unknown");
        }
        other => panic!("expected endpoint error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_error_with_unparsable_body() {
    let (port, _heads) = spawn_status_server("HTTP/1.1 500 Oops", "not json at all").await;

    let err = tunnel()
        .query_proxy_info(Some(StatusRequest {
            port: Some(port),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, StatusError::Parse(_)));
}

#[tokio::test]
async fn test_status_path_override() {
    let (port, mut heads) = spawn_status_server("HTTP/1.1 200 OK", "{}").await;

    tunnel()
        .query_proxy_info(Some(StatusRequest {
            port: Some(port),
            path: Some("/custom".to_string()),
            headers: vec![("X-Probe".to_string(), "1".to_string())],
            ..Default::default()
        }))
        .await
        .unwrap();

    let head = String::from_utf8(heads.recv().await.unwrap()).unwrap();
    assert!(head.starts_with("GET /custom HTTP/1.1\r\n"));
    assert!(head.contains("X-Probe: 1\r\n"));
}
