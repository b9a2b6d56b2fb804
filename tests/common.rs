// tests/common.rs
#![allow(dead_code)]

use flate2::write::DeflateEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

static INIT: Once = Once::new();

pub const WAIT: Duration = Duration::from_secs(5);

// Loads .env (for the ignored live tests) and routes `log` output to the test harness.
pub fn setup() {
    INIT.call_once(|| {
        if dotenv::from_path(".env").is_err() {
            let _ = dotenv::from_path("../.env");
        }
        env_logger::builder().is_test(true).try_init().ok();
    });
}

pub fn get_env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{} environment variable not set", name))
}

/// Raw-deflates `text` the way the exchange compresses binary frames.
pub fn deflate(text: &str) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

enum Command {
    Send(Message),
    Kill,
}

/// One accepted client connection, scripted from the test.
pub struct MockConnection {
    incoming: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<Command>,
    pings: Arc<AtomicUsize>,
}

impl MockConnection {
    /// Next non-ping text frame sent by the client.
    pub async fn recv_text(&mut self) -> String {
        timeout(WAIT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client connection closed")
    }

    /// Next client frame parsed as JSON.
    pub async fn recv_json(&mut self) -> serde_json::Value {
        let text = self.recv_text().await;
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("bad client frame {}: {}", text, e))
    }

    /// Whether the client sent anything but pings within `window`.
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        timeout(window, self.incoming.recv()).await.is_err()
    }

    pub fn send_text(&self, text: &str) {
        let _ = self
            .commands
            .send(Command::Send(Message::Text(text.to_string())));
    }

    pub fn send_compressed(&self, text: &str) {
        let _ = self.commands.send(Command::Send(Message::Binary(deflate(text))));
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Drops the TCP connection without a close handshake.
    pub fn kill(&self) {
        let _ = self.commands.send(Command::Kill);
    }
}

/// A local websocket endpoint standing in for the exchange.
pub struct MockExchange {
    pub url: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockExchange {
    /// `auto_pong` answers every `ping` text frame with `pong`.
    pub async fn start(auto_pong: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/v3", listener.local_addr().unwrap());
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                let (in_tx, incoming) = mpsc::unbounded_channel();
                let (commands, mut command_rx) = mpsc::unbounded_channel();
                let pings = Arc::new(AtomicUsize::new(0));
                let seen = Arc::clone(&pings);

                tokio::spawn(async move {
                    let (mut sink, mut source) = ws.split();
                    loop {
                        tokio::select! {
                            next = source.next() => match next {
                                Some(Ok(Message::Text(text))) if text == "ping" => {
                                    seen.fetch_add(1, Ordering::SeqCst);
                                    if auto_pong && sink.send(Message::Text("pong".to_string())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Text(text))) => {
                                    let _ = in_tx.send(text);
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                            command = command_rx.recv() => match command {
                                Some(Command::Send(message)) => {
                                    if sink.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Kill) | None => break,
                            },
                        }
                    }
                });

                if conn_tx
                    .send(MockConnection {
                        incoming,
                        commands,
                        pings,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Self { url, connections }
    }

    /// The next client connection.
    pub async fn accept(&mut self) -> MockConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a client connection")
            .expect("mock exchange stopped")
    }

    /// The next client connection if one arrives within `window`.
    pub async fn try_accept(&mut self, window: Duration) -> Option<MockConnection> {
        timeout(window, self.connections.recv()).await.ok().flatten()
    }
}
