// demos/depth_stream.rs
use okex_connector_rs::config::{Config, WebsocketConfig};
use okex_connector_rs::websocket::{
    ConnectionState, DepthAction, ErrorEvent, TableMessage, WebsocketClient, WebsocketHandlers,
};
use std::env;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn depth_handler(message: TableMessage) {
    match message {
        TableMessage::Depth(frame) if frame.action == DepthAction::Corrupt => {
            println!("Book discarded for {:?}, waiting for a new snapshot", frame.corrupted);
        }
        TableMessage::Depth(frame) => {
            for update in &frame.data {
                println!(
                    "{:?} {}: {} bids, {} asks",
                    frame.action,
                    update.instrument_id,
                    update.bids.len(),
                    update.asks.len()
                );
            }
        }
        TableMessage::Data(frame) => println!("{}: {:?}", frame.table, frame.data),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenv::dotenv().ok();

    let instrument = env::args().nth(1).unwrap_or_else(|| "BTC-USDT".to_string());
    let config = Config::from_env()?;
    println!("Connecting to {}...", config.ws_endpoint);

    let handlers = WebsocketHandlers {
        on_close: Some(Arc::new(|| println!("Connection lost, reconnecting..."))),
        on_error: Some(Arc::new(|error: ErrorEvent| eprintln!("Exchange error: {:?}", error))),
        ..Default::default()
    };
    let client = WebsocketClient::connect(WebsocketConfig::from(&config), handlers).await?;

    client
        .subscribe_spot_depth(&instrument, Arc::new(depth_handler))
        .await?;
    client
        .subscribe_spot_ticker(&instrument, Arc::new(depth_handler))
        .await?;

    // Print the top of book every few seconds.
    for _ in 0..10 {
        sleep(Duration::from_secs(3)).await;
        if client.state() != ConnectionState::Connected {
            println!("State: {:?}", client.state());
            continue;
        }
        match client.get_order_book("spot/depth", &instrument) {
            Some(book) => println!(
                "{} best bid {:?} / best ask {:?} (spread {:?})",
                instrument,
                book.best_bid().map(|l| l.price),
                book.best_ask().map(|l| l.price),
                book.spread()
            ),
            None => println!("No book for {} yet", instrument),
        }
    }

    client.unsubscribe("spot/depth", &instrument).await?;
    client.unsubscribe("spot/ticker", &instrument).await?;
    sleep(Duration::from_secs(1)).await;

    println!("Stopping client...");
    client.stop().await;
    Ok(())
}
