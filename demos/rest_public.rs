// demos/rest_public.rs
use okex_connector_rs::config::Config;
use okex_connector_rs::rest::Client;
use okex_connector_rs::types::{GetBookParams, GetCandlesParams, GetTradesParams, Granularity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let client = Client::new(&Config::from_env()?)?;
    let instrument = "BTC-USDT";

    println!("\nFetching ticker...");
    let ticker = client.get_spot_ticker(instrument).await?;
    println!(
        "  {} last {} bid {} ask {}",
        ticker.instrument_id, ticker.last, ticker.best_bid, ticker.best_ask
    );

    println!("\nFetching book...");
    let book = client
        .get_spot_book(
            instrument,
            Some(GetBookParams {
                size: Some(5),
                depth: None,
            }),
        )
        .await?;
    for ask in book.asks.iter().rev() {
        println!("  ask {} x {}", ask.price, ask.size);
    }
    for bid in &book.bids {
        println!("  bid {} x {}", bid.price, bid.size);
    }

    println!("\nFetching recent trades...");
    let trades = client
        .get_spot_trades(instrument, Some(GetTradesParams { limit: Some(5) }))
        .await?;
    for trade in trades {
        println!("  {} {:?} {} @ {}", trade.timestamp, trade.side, trade.size, trade.price);
    }

    println!("\nFetching hourly candles...");
    let candles = client
        .get_spot_candles(
            instrument,
            Some(GetCandlesParams {
                granularity: Some(Granularity::Hour1),
                ..Default::default()
            }),
        )
        .await?;
    for candle in candles.iter().take(5) {
        println!(
            "  {} o {} h {} l {} c {} v {}",
            candle.time, candle.open, candle.high, candle.low, candle.close, candle.volume
        );
    }

    if Config::from_env()?.credentials.is_some() {
        println!("\nFetching balances...");
        for account in client.get_spot_accounts().await? {
            println!("  {}: {} available", account.currency, account.available);
        }
    }

    Ok(())
}
