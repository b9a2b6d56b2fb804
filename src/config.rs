//! Client configuration.
//!
//! [`Config`] carries the REST endpoint, the websocket endpoint and the API
//! credentials. [`WebsocketConfig`] holds everything the streaming session needs,
//! including the reconnect and liveness timings.

use crate::error::{OkexError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REST_ENDPOINT: &str = "https://www.okex.com";
pub const DEFAULT_WS_ENDPOINT: &str = "wss://real.okex.com:8443/ws/v3";
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// API key, secret and passphrase issued by the exchange.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            passphrase: passphrase.into(),
        }
    }
}

// Never print the secret or passphrase.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL, e.g. `https://www.okex.com`.
    pub endpoint: String,
    /// Websocket URL, e.g. `wss://real.okex.com:8443/ws/v3`.
    pub ws_endpoint: String,
    pub credentials: Option<Credentials>,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REST_ENDPOINT.to_string(),
            ws_endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            credentials: None,
            timeout_secs: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl Config {
    pub fn new(
        endpoint: impl Into<String>,
        ws_endpoint: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            ws_endpoint: ws_endpoint.into(),
            credentials,
            timeout_secs: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    /// Loads configuration from `OKEX_*` environment variables.
    ///
    /// `OKEX_REST_ENDPOINT`, `OKEX_WS_ENDPOINT` and `OKEX_TIMEOUT_SECS` fall back to
    /// defaults. `OKEX_API_KEY`, `OKEX_SECRET_KEY` and `OKEX_PASSPHRASE` are optional
    /// as a group, but setting only some of them is an error.
    pub fn from_env() -> Result<Self> {
        let endpoint =
            env::var("OKEX_REST_ENDPOINT").unwrap_or_else(|_| DEFAULT_REST_ENDPOINT.to_string());
        let ws_endpoint =
            env::var("OKEX_WS_ENDPOINT").unwrap_or_else(|_| DEFAULT_WS_ENDPOINT.to_string());
        let timeout_secs = match env::var("OKEX_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|e| {
                OkexError::ConfigError(format!("OKEX_TIMEOUT_SECS is not a number: {}", e))
            })?,
            Err(_) => DEFAULT_TIMEOUT_SECONDS,
        };

        let parts = (
            env::var("OKEX_API_KEY").ok(),
            env::var("OKEX_SECRET_KEY").ok(),
            env::var("OKEX_PASSPHRASE").ok(),
        );
        let credentials = match parts {
            (Some(key), Some(secret), Some(passphrase)) => {
                Some(Credentials::new(key, secret, passphrase))
            }
            (None, None, None) => None,
            _ => {
                return Err(OkexError::ConfigError(
                    "OKEX_API_KEY, OKEX_SECRET_KEY and OKEX_PASSPHRASE must be set together"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            endpoint,
            ws_endpoint,
            credentials,
            timeout_secs,
        })
    }
}

/// How the session redials after losing its transport.
///
/// One *round* is up to `max_attempts` dials. The delay before attempt `n` of a
/// round is `base_delay * backoff_factor^n`, capped at `max_delay`. When a round
/// is exhausted at runtime the session waits `base_delay` and starts another
/// round, until `max_rounds` (if set) is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub max_rounds: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(60),
            max_rounds: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.min(32) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn rounds_exhausted(&self, rounds: u32) -> bool {
        matches!(self.max_rounds, Some(max) if rounds >= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivenessConfig {
    /// How often a `ping` probe is written.
    pub ping_interval: Duration,
    /// Longest silence tolerated before the transport is considered dead.
    pub pong_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(9),
            pong_timeout: Duration::from_secs(35),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    pub url: String,
    /// Ask the exchange for deflate-compressed binary frames.
    pub compress: bool,
    pub credentials: Option<Credentials>,
    pub reconnect: ReconnectPolicy,
    pub liveness: LivenessConfig,
    pub handshake_timeout: Duration,
    /// Pause before redialing when re-authentication or resubscription fails.
    pub restore_retry_delay: Duration,
}

impl WebsocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            compress: true,
            credentials: None,
            reconnect: ReconnectPolicy::default(),
            liveness: LivenessConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            restore_retry_delay: Duration::from_secs(3),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The URL actually dialed, with `compress=true` appended when requested.
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(OkexError::ConfigError(format!(
                    "websocket url must use ws or wss, got '{}'",
                    other
                )))
            }
        }
        if self.compress {
            url.query_pairs_mut().append_pair("compress", "true");
        }
        Ok(url)
    }
}

impl From<&Config> for WebsocketConfig {
    fn from(config: &Config) -> Self {
        let ws = WebsocketConfig::new(config.ws_endpoint.clone());
        match &config.credentials {
            Some(creds) => ws.with_credentials(creds.clone()),
            None => ws,
        }
    }
}
