//! Wire format for the v3 websocket API.
//!
//! Inbound payloads are classified into the closed set of shapes in [`Frame`].
//! Binary payloads are raw-deflate compressed text and are inflated first.
//! Outbound control frames are the `{"op": ..., "args": [...]}` requests plus
//! the literal `ping` probe.

use crate::error::{OkexError, Result};
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// One subscribable stream: a channel such as `spot/depth` plus an optional
/// filter such as an instrument id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionTopic {
    pub channel: String,
    pub filter: Option<String>,
}

impl SubscriptionTopic {
    pub fn new(channel: impl Into<String>, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        Self {
            channel: channel.into(),
            filter: if filter.is_empty() { None } else { Some(filter) },
        }
    }

    pub fn channel_only(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            filter: None,
        }
    }

    /// The `channel:filter` form used in request args.
    pub fn arg(&self) -> String {
        match &self.filter {
            Some(filter) => format!("{}:{}", self.channel, filter),
            None => self.channel.clone(),
        }
    }
}

impl fmt::Display for SubscriptionTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arg())
    }
}

impl FromStr for SubscriptionTopic {
    type Err = OkexError;

    fn from_str(s: &str) -> Result<Self> {
        let (channel, filter) = match s.split_once(':') {
            Some((channel, filter)) => (channel, filter),
            None => (s, ""),
        };
        if channel.is_empty() {
            return Err(OkexError::DecodeError(format!(
                "topic '{}' has an empty channel",
                s
            )));
        }
        Ok(SubscriptionTopic::new(channel, filter))
    }
}

/// Routing key of a `channel:filter` string.
pub fn channel_of(arg: &str) -> &str {
    arg.split_once(':').map(|(channel, _)| channel).unwrap_or(arg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableAction {
    Partial,
    Update,
}

/// A `{"table": ..., "action": ..., "data": [...]}` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFrame {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<TableAction>,
    #[serde(default)]
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "errorCode", default, deserialize_with = "lenient_code")]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Subscribe,
    Unsubscribe,
    Login,
}

/// Acknowledgement of a subscribe, unsubscribe or login request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelEvent {
    pub event: EventKind,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Liveness ack. Never routed.
    Pong,
    Error(ErrorEvent),
    Event(ChannelEvent),
    Snapshot(TableFrame),
    Incremental(TableFrame),
    Unrecognized(String),
}

fn lenient_code<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Num(i64),
        Str(String),
    }
    Ok(match Option::<Code>::deserialize(deserializer)? {
        Some(Code::Num(n)) => Some(n),
        Some(Code::Str(s)) => s.parse().ok(),
        None => None,
    })
}

/// Inflates a raw-deflate binary frame into its text payload.
pub fn inflate(bytes: &[u8]) -> Result<String> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|e| OkexError::DecompressError(e.to_string()))?;
    Ok(text)
}

pub fn decode_binary(bytes: &[u8]) -> Result<Frame> {
    let text = inflate(bytes)?;
    decode_text(&text)
}

pub fn decode_text(text: &str) -> Result<Frame> {
    if text == PONG {
        return Ok(Frame::Pong);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| OkexError::DecodeError(format!("invalid json: {}", e)))?;
    let Some(obj) = value.as_object() else {
        return Ok(Frame::Unrecognized(text.to_string()));
    };

    if let Some(event) = obj.get("event").and_then(Value::as_str).map(str::to_owned) {
        return match event.as_str() {
            "error" => Ok(Frame::Error(from_value(value)?)),
            "subscribe" | "unsubscribe" | "login" => Ok(Frame::Event(from_value(value)?)),
            _ => Ok(Frame::Unrecognized(text.to_string())),
        };
    }

    if obj.contains_key("table") {
        let frame: TableFrame = from_value(value)?;
        return Ok(match frame.action {
            Some(TableAction::Update) => Frame::Incremental(frame),
            // Pushes without an action replace whatever the consumer held.
            Some(TableAction::Partial) | None => Frame::Snapshot(frame),
        });
    }

    Ok(Frame::Unrecognized(text.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| OkexError::DecodeError(e.to_string()))
}

#[derive(Serialize)]
struct OpRequest<'a> {
    op: &'a str,
    args: Vec<String>,
}

fn encode_op(op: &str, topics: &[SubscriptionTopic]) -> Result<String> {
    if topics.is_empty() {
        return Err(OkexError::WebsocketError(format!(
            "cannot encode {} with no topics",
            op
        )));
    }
    let request = OpRequest {
        op,
        args: topics.iter().map(SubscriptionTopic::arg).collect(),
    };
    Ok(serde_json::to_string(&request)?)
}

/// Encodes one subscribe request carrying every topic.
pub fn encode_subscribe(topics: &[SubscriptionTopic]) -> Result<String> {
    encode_op("subscribe", topics)
}

pub fn encode_unsubscribe(topics: &[SubscriptionTopic]) -> Result<String> {
    encode_op("unsubscribe", topics)
}

pub fn encode_login(
    api_key: &str,
    passphrase: &str,
    timestamp: &str,
    signature: &str,
) -> Result<String> {
    let request = OpRequest {
        op: "login",
        args: vec![
            api_key.to_string(),
            passphrase.to_string(),
            timestamp.to_string(),
            signature.to_string(),
        ],
    };
    Ok(serde_json::to_string(&request)?)
}
