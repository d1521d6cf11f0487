//! Shared test fakes: an in-process rendezvous server speaking the real
//! challenge/response protocol over TLS, and small local backends.
#![allow(dead_code)]

use passage_handshake::{Challenge, Response, RESPONSE_LEN};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub fn tls_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::try_from(certified.key_pair.serialize_der()).unwrap();

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// A fake rendezvous server. Challenges and verifies every inbound
/// connection, counts the ones that authenticate, and hands their
/// streams to the test for driving user traffic.
pub struct FakeRemote {
    pub port: u16,
    pub authenticated: Arc<AtomicUsize>,
    pub sessions: mpsc::UnboundedReceiver<TlsStream<TcpStream>>,
}

impl FakeRemote {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = tls_acceptor();
        let authenticated = Arc::new(AtomicUsize::new(0));
        let (session_tx, sessions) = mpsc::unbounded_channel();

        let counter = authenticated.clone();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let session_tx = session_tx.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(mut stream) = acceptor.accept(tcp).await else {
                        return;
                    };

                    // Challenge is sent as exactly one write.
                    let challenge = Challenge::generate();
                    if stream.write_all(&challenge.to_bytes()).await.is_err() {
                        return;
                    }

                    let mut buf = vec![0u8; RESPONSE_LEN];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    let Ok(response) = Response::parse(&buf) else {
                        return;
                    };
                    if response.verify(&challenge).is_err() {
                        return;
                    }

                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = session_tx.send(stream);
                });
            }
        });

        Self {
            port,
            authenticated,
            sessions,
        }
    }

    pub async fn wait_for_authenticated(&self, n: usize) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while self.authenticated.load(Ordering::SeqCst) < n {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {} authenticated connections (got {})",
                n,
                self.authenticated.load(Ordering::SeqCst)
            )
        });
    }
}

/// A local backend that holds every accepted connection open, greets it
/// with a banner and forwards every chunk it receives to the test.
pub struct CaptureBackend {
    pub port: u16,
    pub chunks: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub const BACKEND_BANNER: &[u8] = b"backend-ready\n";

impl CaptureBackend {
    pub async fn spawn(banner: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (chunk_tx, chunks) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let chunk_tx = chunk_tx.clone();
                tokio::spawn(async move {
                    if banner && socket.write_all(BACKEND_BANNER).await.is_err() {
                        return;
                    }
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if chunk_tx.send(buf[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { port, chunks }
    }
}
