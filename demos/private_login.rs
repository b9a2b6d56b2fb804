// demos/private_login.rs
use futures_util::FutureExt;
use okex_connector_rs::config::{Config, WebsocketConfig};
use okex_connector_rs::websocket::client::ConnectHook;
use okex_connector_rs::websocket::{ErrorEvent, TableMessage, WebsocketClient, WebsocketHandlers};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn account_handler(message: TableMessage) {
    if let TableMessage::Data(frame) = message {
        for entry in frame.data {
            println!("{}: {}", frame.table, entry);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    if config.credentials.is_none() {
        anyhow::bail!("OKEX_API_KEY, OKEX_SECRET_KEY and OKEX_PASSPHRASE must be set");
    }

    let hook: ConnectHook = Arc::new(|client: WebsocketClient| {
        async move {
            println!("Connected (logged in: {})", client.is_logged_in());
            Ok(())
        }
        .boxed()
    });
    let handlers = WebsocketHandlers {
        post_connect: Some(hook),
        on_error: Some(Arc::new(|error: ErrorEvent| eprintln!("Exchange error: {:?}", error))),
        ..Default::default()
    };
    let client = WebsocketClient::connect(WebsocketConfig::from(&config), handlers).await?;

    client.login().await?;
    // Private channels are rejected until the login is acknowledged.
    for _ in 0..50 {
        if client.is_logged_in() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    if !client.is_logged_in() {
        client.stop().await;
        anyhow::bail!("login was not acknowledged");
    }

    client
        .subscribe_many(
            "spot/account",
            &["BTC", "USDT"],
            Arc::new(account_handler),
        )
        .await?;
    client
        .subscribe("spot/order", "BTC-USDT", Arc::new(account_handler))
        .await?;

    println!("Listening for account events for 60 seconds...");
    sleep(Duration::from_secs(60)).await;

    client.stop().await;
    Ok(())
}
