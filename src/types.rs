use crate::websocket::book::PriceLevel;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Enums ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Candle width in seconds accepted by the candles endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute1 = 60,
    Minute3 = 180,
    Minute5 = 300,
    Minute15 = 900,
    Minute30 = 1800,
    Hour1 = 3600,
    Hour2 = 7200,
    Hour4 = 14400,
    Hour6 = 21600,
    Hour12 = 43200,
    Day1 = 86400,
    Week1 = 604800,
}

impl Granularity {
    pub fn seconds(self) -> u32 {
        self as u32
    }
}

impl Serialize for Granularity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.seconds())
    }
}

// --- Query Param Structs ---

// `after` / `before` are cursor ids from a previous page.

#[derive(Serialize, Debug, Clone, Default)]
pub struct GetLedgerParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<u32>,
}

#[derive(Serialize, Debug, Clone)]
pub struct GetPendingOrdersParams<'a> {
    pub instrument_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl<'a> GetPendingOrdersParams<'a> {
    pub fn new(instrument_id: &'a str) -> Self {
        Self {
            instrument_id,
            after: None,
            before: None,
            limit: None,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct GetFillsParams<'a> {
    pub instrument_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl<'a> GetFillsParams<'a> {
    pub fn new(instrument_id: &'a str) -> Self {
        Self {
            instrument_id,
            order_id: None,
            after: None,
            before: None,
            limit: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct GetBookParams {
    /// Levels per side, at most 200.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Price aggregation step, e.g. `"0.1"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<String>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct GetTradesParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct GetCandlesParams {
    /// ISO-8601 start time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
}

// --- Response Structs ---

/// Some numeric fields arrive as `""` when they do not apply (e.g. the price of a market order).
fn optional_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(Value::Number(n)) => n
            .to_string()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a decimal, got {}",
            other
        ))),
    }
}

/// The exchange's error body. Older endpoints use `error_code`/`error_message`,
/// some send both forms at once.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub error_code: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ApiErrorBody {
    pub fn code(&self) -> i64 {
        match self.code.as_ref().or(self.error_code.as_ref()) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error_message.as_deref())
            .filter(|m| !m.is_empty())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpotAccount {
    pub currency: String,
    #[serde(rename = "id", default)]
    pub account_id: String,
    pub balance: Decimal,
    pub available: Decimal,
    pub hold: Decimal,
    #[serde(default)]
    pub frozen: Option<Decimal>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub ledger_id: String,
    pub currency: String,
    pub amount: Decimal,
    pub balance: Decimal,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpotOrder {
    pub order_id: String,
    #[serde(default)]
    pub client_oid: String,
    pub instrument_id: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_kind: String,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub price: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub notional: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub filled_size: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub filled_notional: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub price_avg: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    pub timestamp: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpotFill {
    pub ledger_id: String,
    #[serde(default)]
    pub trade_id: Option<String>,
    pub instrument_id: String,
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub side: Side,
    #[serde(default)]
    pub exec_type: Option<String>,
    pub timestamp: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpotInstrument {
    pub instrument_id: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub min_size: Decimal,
    pub size_increment: Decimal,
    pub tick_size: Decimal,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpotTicker {
    pub instrument_id: String,
    pub last: Decimal,
    #[serde(default)]
    pub last_qty: Option<Decimal>,
    pub best_bid: Decimal,
    #[serde(default)]
    pub best_bid_size: Option<Decimal>,
    pub best_ask: Decimal,
    #[serde(default)]
    pub best_ask_size: Option<Decimal>,
    pub open_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub base_volume_24h: Decimal,
    pub quote_volume_24h: Decimal,
    pub timestamp: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpotTrade {
    pub trade_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub timestamp: String,
}

/// REST depth: levels arrive as `[price, size, orders]`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BookResponse {
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
    pub timestamp: String,
}

/// One candle, sent by the exchange as `[time, open, high, low, close, volume]`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "CandleRow")]
pub struct Candle {
    pub time: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Deserialize)]
struct CandleRow(String, Decimal, Decimal, Decimal, Decimal, Decimal);

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        let CandleRow(time, open, high, low, close, volume) = row;
        Candle {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_candle_from_row() {
        let candle: Candle = serde_json::from_str(
            r#"["2019-03-19T16:00:00.000Z","3997.3","4031.9","3982.5","3998.7","26175.21141385"]"#,
        )
        .unwrap();
        assert_eq!(candle.time, "2019-03-19T16:00:00.000Z");
        assert_eq!(candle.close, Decimal::from_str("3998.7").unwrap());
    }

    #[test]
    fn test_query_params_skip_unset_fields() {
        let params = GetFillsParams {
            limit: Some(10),
            ..GetFillsParams::new("BTC-USDT")
        };
        assert_eq!(
            serde_qs::to_string(&params).unwrap(),
            "instrument_id=BTC-USDT&limit=10"
        );

        let candles = GetCandlesParams {
            granularity: Some(Granularity::Hour1),
            ..Default::default()
        };
        assert_eq!(serde_qs::to_string(&candles).unwrap(), "granularity=3600");
    }

    #[test]
    fn test_error_body_accepts_both_shapes() {
        let modern: ApiErrorBody =
            serde_json::from_str(r#"{"code":30008,"message":"timestamp expired"}"#).unwrap();
        assert_eq!(modern.code(), 30008);

        let legacy: ApiErrorBody =
            serde_json::from_str(r#"{"error_code":"33014","error_message":"order not exist"}"#)
                .unwrap();
        assert_eq!(legacy.code(), 33014);
        assert_eq!(legacy.message(), Some("order not exist"));

        let both: ApiErrorBody = serde_json::from_str(
            r#"{"error_message":"","code":30008,"error_code":"30008","message":"Request timestamp expired"}"#,
        )
        .unwrap();
        assert_eq!(both.code(), 30008);
        assert_eq!(both.message(), Some("Request timestamp expired"));
    }

    #[test]
    fn test_market_order_with_empty_price() {
        let order: SpotOrder = serde_json::from_str(
            r#"{"order_id":"2510789768709120","client_oid":"","instrument_id":"BTC-USDT","side":"buy","type":"market","price":"","size":"","notional":"10","filled_size":"0.0025","timestamp":"2019-03-18T07:26:50.000Z"}"#,
        )
        .unwrap();
        assert_eq!(order.price, None);
        assert_eq!(order.notional, Some(Decimal::from_str("10").unwrap()));
        assert_eq!(order.side, Side::Buy);
    }

    #[test]
    fn test_book_response_levels() {
        let book: BookResponse = serde_json::from_str(
            r#"{"asks":[["3993.2","0.41600068","1"]],"bids":[["3993.1","1.1","2"]],"timestamp":"2019-03-20T03:00:00.000Z"}"#,
        )
        .unwrap();
        assert_eq!(book.asks[0].orders, 1);
        assert_eq!(book.bids[0].size, Decimal::from_str("1.1").unwrap());
    }
}
