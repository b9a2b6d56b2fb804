//! Incremental order book reconstruction.
//!
//! Each depth table (`spot/depth`, `swap/depth`, ...) owns a map from instrument id
//! to a [`DepthLadder`]. Snapshot frames replace a ladder, incremental frames merge
//! price-level deltas into it in arrival order. A ladder that fails verification,
//! or an incremental for an instrument with no snapshot, is dropped and reported as
//! a [`DepthError`] so the caller can wait for a fresh snapshot.
//!
//! Readers always get an owned [`OrderBookSnapshot`] copied under the table's read
//! lock, so they never observe a half-applied update.

use crate::websocket::codec::TableAction;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Number of levels per side covered by the exchange checksum.
pub const CHECKSUM_DEPTH: usize = 25;

/// Tables whose pushes are snapshot + incremental depth and are kept by the engine.
/// Fixed-size tables such as `spot/depth5` are plain snapshots and are passed through.
pub fn is_depth_table(table: &str) -> bool {
    table.ends_with("/depth") || table.ends_with("/depth_l2_tbt")
}

/// One price level: `[price, size, orders]`.
///
/// The exchange sends `[price, size, liquidated_orders, orders]` on derivatives
/// books, and strings or numbers for each member; both forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
    pub orders: u64,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal, orders: u64) -> Self {
        Self {
            price,
            size,
            orders,
        }
    }
}

impl<'de> Deserialize<'de> for PriceLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<Decimal>::deserialize(deserializer)?;
        let (price, size, orders) = match raw.as_slice() {
            [price, size] => (*price, *size, Decimal::ZERO),
            [price, size, orders] => (*price, *size, *orders),
            [price, size, _liquidated, orders] => (*price, *size, *orders),
            _ => {
                return Err(de::Error::invalid_length(
                    raw.len(),
                    &"a price level with 2 to 4 members",
                ))
            }
        };
        let orders = orders
            .to_u64()
            .ok_or_else(|| de::Error::custom(format!("invalid order count {}", orders)))?;
        Ok(PriceLevel::new(price, size, orders))
    }
}

impl Serialize for PriceLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.price.to_string())?;
        seq.serialize_element(&self.size.to_string())?;
        seq.serialize_element(&self.orders.to_string())?;
        seq.end()
    }
}

/// One instrument's entry in a depth table push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub instrument_id: String,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<i32>,
}

/// Bid and ask levels of one instrument, keyed by price.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepthLadder {
    bids: BTreeMap<Decimal, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    timestamp: Option<String>,
}

impl DepthLadder {
    /// Builds a ladder from a full snapshot. Zero-size levels are not retained.
    pub fn from_levels(bids: &[PriceLevel], asks: &[PriceLevel]) -> Self {
        let mut ladder = DepthLadder::default();
        ladder.apply(bids, asks);
        ladder
    }

    /// Merges deltas in order: zero size removes the level, anything else
    /// inserts or overwrites it.
    pub fn apply(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        apply_side(&mut self.bids, bids);
        apply_side(&mut self.asks, asks);
    }

    /// Bids from best (highest) to worst.
    pub fn bids(&self) -> impl Iterator<Item = &PriceLevel> + '_ {
        self.bids.values().rev()
    }

    /// Asks from best (lowest) to worst.
    pub fn asks(&self) -> impl Iterator<Item = &PriceLevel> + '_ {
        self.asks.values()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    fn snapshot(&self, instrument_id: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            instrument_id: instrument_id.to_string(),
            bids: self.bids().copied().collect(),
            asks: self.asks().copied().collect(),
            timestamp: self.timestamp.clone(),
        }
    }
}

fn apply_side(side: &mut BTreeMap<Decimal, PriceLevel>, deltas: &[PriceLevel]) {
    for delta in deltas {
        if delta.size.is_zero() {
            side.remove(&delta.price);
        } else {
            side.insert(delta.price, *delta);
        }
    }
}

/// Point-in-time copy of one instrument's book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookSnapshot {
    pub instrument_id: String,
    /// Descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ascending by price.
    pub asks: Vec<PriceLevel>,
    pub timestamp: Option<String>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

/// Decides whether a ladder still matches the checksum the exchange sent with it.
pub trait ChecksumVerifier: Send + Sync {
    fn verify(&self, ladder: &DepthLadder, expected: i32) -> bool;
}

/// The exchange's CRC-32 over the top levels, bids and asks interleaved as
/// `bid_price:bid_size:ask_price:ask_size:...`, read as a signed 32-bit integer.
#[derive(Debug, Clone, Copy)]
pub struct Crc32Checksum {
    depth: usize,
}

impl Default for Crc32Checksum {
    fn default() -> Self {
        Self {
            depth: CHECKSUM_DEPTH,
        }
    }
}

impl Crc32Checksum {
    pub fn with_depth(depth: usize) -> Self {
        Self { depth }
    }

    pub fn checksum_string(&self, ladder: &DepthLadder) -> String {
        let mut bids = ladder.bids();
        let mut asks = ladder.asks();
        let mut parts = Vec::with_capacity(self.depth * 4);
        for _ in 0..self.depth {
            if let Some(bid) = bids.next() {
                parts.push(bid.price.to_string());
                parts.push(bid.size.to_string());
            }
            if let Some(ask) = asks.next() {
                parts.push(ask.price.to_string());
                parts.push(ask.size.to_string());
            }
        }
        parts.join(":")
    }

    pub fn compute(&self, ladder: &DepthLadder) -> i32 {
        crc32fast::hash(self.checksum_string(ladder).as_bytes()) as i32
    }
}

impl ChecksumVerifier for Crc32Checksum {
    fn verify(&self, ladder: &DepthLadder, expected: i32) -> bool {
        self.compute(ladder) == expected
    }
}

/// Accepts every ladder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChecksum;

impl ChecksumVerifier for NoChecksum {
    fn verify(&self, _ladder: &DepthLadder, _expected: i32) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DepthError {
    #[error("incremental update for {instrument_id} in {table} arrived before any snapshot")]
    MissingSnapshot { table: String, instrument_id: String },

    #[error("checksum mismatch for {instrument_id} in {table}: exchange sent {expected}")]
    ChecksumMismatch {
        table: String,
        instrument_id: String,
        expected: i32,
    },
}

impl DepthError {
    pub fn instrument_id(&self) -> &str {
        match self {
            DepthError::MissingSnapshot { instrument_id, .. }
            | DepthError::ChecksumMismatch { instrument_id, .. } => instrument_id,
        }
    }
}

/// Ladders of one depth table.
#[derive(Debug, Default)]
pub struct TableState {
    ladders: RwLock<HashMap<String, DepthLadder>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct OrderBookEngine {
    tables: RwLock<HashMap<String, Arc<TableState>>>,
    verifier: Arc<dyn ChecksumVerifier>,
}

impl Default for OrderBookEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBookEngine {
    /// Engine verifying checksums with [`Crc32Checksum`].
    pub fn new() -> Self {
        Self::with_verifier(Arc::new(Crc32Checksum::default()))
    }

    pub fn with_verifier(verifier: Arc<dyn ChecksumVerifier>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            verifier,
        }
    }

    fn table(&self, table: &str) -> Arc<TableState> {
        if let Some(state) = read_lock(&self.tables).get(table) {
            return Arc::clone(state);
        }
        let mut tables = write_lock(&self.tables);
        Arc::clone(tables.entry(table.to_string()).or_default())
    }

    fn existing_table(&self, table: &str) -> Option<Arc<TableState>> {
        read_lock(&self.tables).get(table).cloned()
    }

    fn verified(&self, ladder: &DepthLadder, checksum: Option<i32>) -> bool {
        match checksum {
            Some(expected) => self.verifier.verify(ladder, expected),
            None => true,
        }
    }

    /// Replaces the instrument's ladder wholesale.
    pub fn apply_snapshot(&self, table: &str, update: &DepthUpdate) -> Result<(), DepthError> {
        let mut ladder = DepthLadder::from_levels(&update.bids, &update.asks);
        ladder.timestamp = update.timestamp.clone();

        let state = self.table(table);
        let mut ladders = write_lock(&state.ladders);
        if !self.verified(&ladder, update.checksum) {
            ladders.remove(&update.instrument_id);
            return Err(DepthError::ChecksumMismatch {
                table: table.to_string(),
                instrument_id: update.instrument_id.clone(),
                expected: update.checksum.unwrap_or_default(),
            });
        }
        ladders.insert(update.instrument_id.clone(), ladder);
        Ok(())
    }

    /// Merges deltas into the instrument's ladder. On failure the ladder is
    /// discarded and stays absent until the next snapshot.
    pub fn apply_incremental(&self, table: &str, update: &DepthUpdate) -> Result<(), DepthError> {
        let missing = || DepthError::MissingSnapshot {
            table: table.to_string(),
            instrument_id: update.instrument_id.clone(),
        };
        let state = self.existing_table(table).ok_or_else(missing)?;
        let mut ladders = write_lock(&state.ladders);
        let ladder = ladders.get_mut(&update.instrument_id).ok_or_else(missing)?;

        ladder.apply(&update.bids, &update.asks);
        if update.timestamp.is_some() {
            ladder.timestamp = update.timestamp.clone();
        }

        if !self.verified(ladder, update.checksum) {
            ladders.remove(&update.instrument_id);
            return Err(DepthError::ChecksumMismatch {
                table: table.to_string(),
                instrument_id: update.instrument_id.clone(),
                expected: update.checksum.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Applies every instrument entry of one frame, in order, and collects the failures.
    pub fn apply_frame(
        &self,
        table: &str,
        action: TableAction,
        updates: &[DepthUpdate],
    ) -> Vec<DepthError> {
        updates
            .iter()
            .filter_map(|update| match action {
                TableAction::Partial => self.apply_snapshot(table, update).err(),
                TableAction::Update => self.apply_incremental(table, update).err(),
            })
            .collect()
    }

    /// Copies the instrument's current book. Never blocks on I/O.
    pub fn read(&self, table: &str, instrument_id: &str) -> Option<OrderBookSnapshot> {
        let state = self.existing_table(table)?;
        let ladders = read_lock(&state.ladders);
        ladders
            .get(instrument_id)
            .map(|ladder| ladder.snapshot(instrument_id))
    }

    pub fn instruments(&self, table: &str) -> Vec<String> {
        match self.existing_table(table) {
            Some(state) => {
                let mut ids: Vec<String> = read_lock(&state.ladders).keys().cloned().collect();
                ids.sort();
                ids
            }
            None => Vec::new(),
        }
    }

    pub fn remove_table(&self, table: &str) {
        write_lock(&self.tables).remove(table);
    }

    /// Drops every table; used when the session is replaced.
    pub fn clear(&self) {
        write_lock(&self.tables).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use std::thread;

    const TABLE: &str = "spot/depth";

    fn d(v: &str) -> Decimal {
        Decimal::from_str(v).unwrap()
    }

    fn lvl(price: &str, size: &str, orders: u64) -> PriceLevel {
        PriceLevel::new(d(price), d(size), orders)
    }

    fn update(
        instrument: &str,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        checksum: Option<i32>,
    ) -> DepthUpdate {
        DepthUpdate {
            instrument_id: instrument.to_string(),
            asks,
            bids,
            timestamp: None,
            checksum,
        }
    }

    #[test]
    fn test_depth_tables() {
        assert!(is_depth_table("spot/depth"));
        assert!(is_depth_table("futures/depth_l2_tbt"));
        assert!(!is_depth_table("spot/depth5"));
        assert!(!is_depth_table("spot/ticker"));
    }

    #[test]
    fn test_price_level_accepts_exchange_forms() {
        let four: PriceLevel = serde_json::from_value(json!(["8.8", "96.99999966", "0", "1"])).unwrap();
        assert_eq!(four, lvl("8.8", "96.99999966", 1));

        let numeric: PriceLevel = serde_json::from_value(json!([100, 1, 1])).unwrap();
        assert_eq!(numeric, lvl("100", "1", 1));

        assert!(serde_json::from_value::<PriceLevel>(json!(["1"])).is_err());
        assert_eq!(
            serde_json::to_value(lvl("8.80", "2", 3)).unwrap(),
            json!(["8.80", "2", "3"])
        );
    }

    #[test]
    fn test_snapshot_then_incremental_scenario() {
        let engine = OrderBookEngine::new();
        engine
            .apply_snapshot(TABLE, &update("BTC-USDT", vec![lvl("100", "1", 1)], vec![lvl("101", "2", 1)], None))
            .unwrap();
        engine
            .apply_incremental(
                TABLE,
                &update("BTC-USDT", vec![lvl("100", "0", 0), lvl("99", "3", 1)], vec![], None),
            )
            .unwrap();

        let book = engine.read(TABLE, "BTC-USDT").unwrap();
        assert_eq!(book.bids, vec![lvl("99", "3", 1)]);
        assert_eq!(book.asks, vec![lvl("101", "2", 1)]);
    }

    #[test]
    fn test_zero_size_delta_for_absent_price_is_noop() {
        let mut ladder = DepthLadder::from_levels(&[lvl("100", "1", 1)], &[lvl("101", "2", 1)]);
        let before = ladder.clone();
        ladder.apply(&[lvl("98", "0", 0)], &[lvl("105", "0", 0)]);
        assert_eq!(ladder, before);

        ladder.apply(&[lvl("100", "0", 0)], &[]);
        assert_eq!(ladder.bids().count(), 0);
    }

    #[test]
    fn test_snapshot_drops_zero_size_levels_and_sorts_sides() {
        let ladder = DepthLadder::from_levels(
            &[lvl("99", "1", 1), lvl("101", "1", 1), lvl("100", "0", 0)],
            &[lvl("105", "1", 1), lvl("103", "2", 1)],
        );
        let bids: Vec<Decimal> = ladder.bids().map(|l| l.price).collect();
        let asks: Vec<Decimal> = ladder.asks().map(|l| l.price).collect();
        assert_eq!(bids, vec![d("101"), d("99")]);
        assert_eq!(asks, vec![d("103"), d("105")]);
    }

    #[test]
    fn test_incremental_without_snapshot_is_corrupt() {
        let engine = OrderBookEngine::new();
        let err = engine
            .apply_incremental(TABLE, &update("BTC-USDT", vec![lvl("1", "1", 1)], vec![], None))
            .unwrap_err();
        assert!(matches!(err, DepthError::MissingSnapshot { .. }));
        assert_eq!(err.instrument_id(), "BTC-USDT");
        assert!(engine.read(TABLE, "BTC-USDT").is_none());
    }

    #[test]
    fn test_crc32_matches_known_vector() {
        let ladder = DepthLadder::from_levels(
            &[lvl("3366.1", "7", 1), lvl("3366", "6", 1)],
            &[lvl("3366.8", "9", 1), lvl("3368", "8", 1), lvl("3372", "8", 1)],
        );
        let crc = Crc32Checksum::default();
        assert_eq!(
            crc.checksum_string(&ladder),
            "3366.1:7:3366.8:9:3366:6:3368:8:3372:8"
        );
        assert_eq!(crc.compute(&ladder), 1362239393);
    }

    #[test]
    fn test_checksum_verified_on_snapshot_and_incremental() {
        let engine = OrderBookEngine::new();
        engine
            .apply_snapshot(
                TABLE,
                &update("BTC-USDT", vec![lvl("100", "1", 1)], vec![lvl("101", "2", 1)], Some(-538653813)),
            )
            .unwrap();
        engine
            .apply_incremental(
                TABLE,
                &update("BTC-USDT", vec![lvl("100", "0", 0), lvl("99", "3", 1)], vec![], Some(2032405109)),
            )
            .unwrap();
        assert_eq!(engine.read(TABLE, "BTC-USDT").unwrap().bids, vec![lvl("99", "3", 1)]);
    }

    #[test]
    fn test_checksum_mismatch_discards_only_that_instrument() {
        let engine = OrderBookEngine::new();
        for id in ["BTC-USDT", "ETH-USDT"] {
            engine
                .apply_snapshot(TABLE, &update(id, vec![lvl("100", "1", 1)], vec![lvl("101", "2", 1)], None))
                .unwrap();
        }

        let err = engine
            .apply_incremental(TABLE, &update("BTC-USDT", vec![lvl("99", "3", 1)], vec![], Some(12345)))
            .unwrap_err();
        assert!(matches!(err, DepthError::ChecksumMismatch { expected: 12345, .. }));

        assert!(engine.read(TABLE, "BTC-USDT").is_none());
        assert!(engine.read(TABLE, "ETH-USDT").is_some());
        assert_eq!(engine.instruments(TABLE), vec!["ETH-USDT".to_string()]);

        // Later deltas stay rejected until a snapshot arrives.
        assert!(engine
            .apply_incremental(TABLE, &update("BTC-USDT", vec![lvl("98", "1", 1)], vec![], None))
            .is_err());
        engine
            .apply_snapshot(TABLE, &update("BTC-USDT", vec![lvl("97", "1", 1)], vec![], None))
            .unwrap();
        assert_eq!(engine.read(TABLE, "BTC-USDT").unwrap().bids, vec![lvl("97", "1", 1)]);
    }

    #[test]
    fn test_custom_verifier_is_used() {
        struct RejectAll;
        impl ChecksumVerifier for RejectAll {
            fn verify(&self, _ladder: &DepthLadder, _expected: i32) -> bool {
                false
            }
        }

        let strict = OrderBookEngine::with_verifier(Arc::new(RejectAll));
        let snap = update("BTC-USDT", vec![lvl("1", "1", 1)], vec![], Some(0));
        assert!(strict.apply_snapshot(TABLE, &snap).is_err());

        let lenient = OrderBookEngine::with_verifier(Arc::new(NoChecksum));
        assert!(lenient.apply_snapshot(TABLE, &snap).is_ok());
    }

    #[test]
    fn test_apply_frame_reports_each_failure() {
        let engine = OrderBookEngine::new();
        engine
            .apply_snapshot(TABLE, &update("BTC-USDT", vec![lvl("1", "1", 1)], vec![], None))
            .unwrap();
        let errors = engine.apply_frame(
            TABLE,
            TableAction::Update,
            &[
                update("BTC-USDT", vec![lvl("2", "1", 1)], vec![], None),
                update("LTC-USDT", vec![lvl("2", "1", 1)], vec![], None),
            ],
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].instrument_id(), "LTC-USDT");
        assert_eq!(engine.read(TABLE, "BTC-USDT").unwrap().bids.len(), 2);
    }

    #[test]
    fn test_read_returns_independent_copy() {
        let engine = OrderBookEngine::new();
        engine
            .apply_snapshot(TABLE, &update("BTC-USDT", vec![lvl("100", "1", 1)], vec![lvl("101", "1", 1)], None))
            .unwrap();
        let before = engine.read(TABLE, "BTC-USDT").unwrap();
        engine
            .apply_incremental(TABLE, &update("BTC-USDT", vec![lvl("100", "5", 2)], vec![], None))
            .unwrap();

        assert_eq!(before.best_bid(), Some(&lvl("100", "1", 1)));
        assert_eq!(engine.read(TABLE, "BTC-USDT").unwrap().best_bid(), Some(&lvl("100", "5", 2)));
        assert_eq!(before.spread(), Some(d("1")));
    }

    #[test]
    fn test_clear_and_remove_table() {
        let engine = OrderBookEngine::new();
        let snap = update("BTC-USDT", vec![lvl("1", "1", 1)], vec![], None);
        engine.apply_snapshot("spot/depth", &snap).unwrap();
        engine.apply_snapshot("swap/depth", &snap).unwrap();

        engine.remove_table("spot/depth");
        assert!(engine.read("spot/depth", "BTC-USDT").is_none());
        assert!(engine.read("swap/depth", "BTC-USDT").is_some());

        engine.clear();
        assert!(engine.read("swap/depth", "BTC-USDT").is_none());
    }

    #[test]
    fn test_concurrent_read_never_sees_partial_update() {
        let engine = Arc::new(OrderBookEngine::new());
        let prices: Vec<String> = (1..=20).map(|p| p.to_string()).collect();
        let snapshot: Vec<PriceLevel> = prices.iter().map(|p| lvl(p, "1", 1)).collect();
        engine
            .apply_snapshot(TABLE, &update("BTC-USDT", snapshot, vec![], None))
            .unwrap();

        let writer = {
            let engine = Arc::clone(&engine);
            let prices = prices.clone();
            thread::spawn(move || {
                for round in 2..=300u64 {
                    let size = round.to_string();
                    let deltas: Vec<PriceLevel> = prices.iter().map(|p| lvl(p, &size, round)).collect();
                    engine
                        .apply_incremental(TABLE, &update("BTC-USDT", deltas, vec![], None))
                        .unwrap();
                }
            })
        };

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let book = engine.read(TABLE, "BTC-USDT").unwrap();
                    assert_eq!(book.bids.len(), 20);
                    let first = book.bids[0].size;
                    assert!(book.bids.iter().all(|l| l.size == first), "observed a mixed ladder");
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        let book = engine.read(TABLE, "BTC-USDT").unwrap();
        assert!(book.bids.iter().all(|l| l.size == d("300")));
    }
}
