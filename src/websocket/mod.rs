//! Streaming client for the OKEx v3 websocket API.
//!
//! A single [`WebsocketClient`] owns one logical session with the exchange. It keeps
//! the transport alive, heals it when it drops, and maintains incrementally updated
//! order books for every subscribed depth table.
//!
//! - [`codec`]: frame decoding (text and deflate-compressed binary) and request encoding
//! - [`book`]: order book reconstruction and checksum verification
//! - [`router`]: per-channel callback bindings and subscription confirmations
//! - [`client`]: the session itself
//!
//! # Usage
//!
//! ```no_run
//! use okex_connector_rs::config::WebsocketConfig;
//! use okex_connector_rs::websocket::{TableMessage, WebsocketClient, WebsocketHandlers};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = WebsocketConfig::new("wss://real.okex.com:8443/ws/v3");
//!     let client = WebsocketClient::connect(config, WebsocketHandlers::default())
//!         .await
//!         .expect("Failed to connect");
//!
//!     client
//!         .subscribe(
//!             "spot/depth",
//!             "BTC-USDT",
//!             Arc::new(|msg: TableMessage| println!("{} update", msg.table())),
//!         )
//!         .await
//!         .expect("Failed to subscribe");
//!
//!     tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl+c");
//!     if let Some(book) = client.get_order_book("spot/depth", "BTC-USDT") {
//!         println!("best bid {:?}, best ask {:?}", book.best_bid(), book.best_ask());
//!     }
//!     client.stop().await;
//! }
//! ```
//!
//! # Private Channels
//!
//! Call [`WebsocketClient::login`] once with credentials in the config. The session
//! remembers it and logs in again before resubscribing after every reconnect.
//!
//! # Reconnection Behavior
//!
//! - A lost transport moves the session to `Degraded` and calls `on_close`
//! - Books are discarded; they come back with the snapshots that follow resubscription
//! - Dial rounds follow [`ReconnectPolicy`](crate::config::ReconnectPolicy)
//! - A `ping` is written every `ping_interval`; silence longer than `pong_timeout`
//!   forces a reconnect
//!
//! # Message Handling
//!
//! Callbacks run on the session's work task, one at a time, in arrival order. They
//! should be quick; a slow callback delays every channel and the liveness probe.
//! Once 1024 decoded frames are waiting, the session stops reading from the
//! socket until the callbacks catch up. A panicking callback is logged at `error`
//! and loses only the frame it was handling.

pub mod book;
pub mod client;
pub mod codec;
pub mod router;

pub use book::{
    ChecksumVerifier, Crc32Checksum, DepthError, DepthLadder, DepthUpdate, NoChecksum,
    OrderBookEngine, OrderBookSnapshot, PriceLevel,
};
pub use client::{ConnectionState, WebsocketClient, WebsocketHandlers};
pub use codec::{ErrorEvent, SubscriptionTopic, TableFrame};
pub use router::{DepthAction, DepthFrame, TableCallback, TableMessage};
