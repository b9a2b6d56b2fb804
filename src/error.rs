use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use url::ParseError;

pub type Result<T, E = OkexError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum OkexError {
    #[error("Client Error: status={status}, code={code}, message={message}, data={data:?}")]
    ClientError {
        status: StatusCode,
        code: i64,
        message: String,
        data: Option<Value>,
        header: HeaderMap,
    },

    #[error("Server Error: status={status}, code={code}, message={message}")]
    ServerError {
        status: StatusCode,
        code: i64,
        message: String,
        header: HeaderMap,
    },

    #[error("WebSocket Error: {0}")]
    WebsocketError(String),

    #[error("Connect Error: gave up dialing {url} after {attempts} attempts: {reason}")]
    ConnectError {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("WebSocket Error: not connected")]
    NotConnected,

    #[error("Authentication Error: {0}")]
    AuthenticationError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Frame Decode Error: {0}")]
    DecodeError(String),

    #[error("Frame Decompress Error: {0}")]
    DecompressError(String),

    #[error("HTTP Request Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON Serialization/Deserialization Error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Query String Error: {0}")]
    QueryError(#[from] serde_qs::Error),

    #[error("URL Parsing Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("Invalid HTTP Header Value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Transport Error: {0}")]
    TransportError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}
