// tests/login_logging.rs
// Installs its own logger, so it lives in a separate test binary.
mod common;

use common::{wait_until, MockExchange};
use log::{LevelFilter, Log, Metadata, Record};
use okex_connector_rs::config::{Credentials, WebsocketConfig};
use okex_connector_rs::websocket::{TableCallback, TableMessage, WebsocketClient, WebsocketHandlers};
use std::sync::{Arc, Mutex};

static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.target().starts_with("okex_connector_rs") {
            LINES.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

fn captured() -> Vec<String> {
    LINES.lock().unwrap().clone()
}

#[tokio::test]
async fn test_login_frame_is_never_logged() {
    log::set_logger(&LOGGER).expect("Failed to install logger");
    log::set_max_level(LevelFilter::Trace);

    let mut exchange = MockExchange::start(true).await;
    let config = WebsocketConfig::new(exchange.url.clone()).with_credentials(Credentials::new(
        "key",
        "secret-key",
        "MY-PASSPHRASE",
    ));
    let client = WebsocketClient::connect(config, WebsocketHandlers::default())
        .await
        .unwrap();
    let mut conn = exchange.accept().await;

    client.login().await.unwrap();
    let login = conn.recv_json().await;
    let signature = login["args"][3].as_str().unwrap().to_string();

    let callback: TableCallback = Arc::new(|_msg: TableMessage| {});
    client.subscribe("spot/ticker", "BTC-USDT", callback).await.unwrap();
    conn.recv_text().await;

    // Other outbound frames are traced verbatim.
    assert!(
        wait_until(|| captured()
            .iter()
            .any(|line| line.contains(r#""op":"subscribe""#)))
        .await
    );
    let lines = captured();
    assert!(lines.iter().any(|line| line.contains("Sending login")));
    for line in &lines {
        assert!(!line.contains("MY-PASSPHRASE"), "secret logged: {}", line);
        assert!(!line.contains(&signature), "signature logged: {}", line);
        assert!(!line.contains(r#""op":"login""#), "login frame logged: {}", line);
    }

    client.stop().await;
}
