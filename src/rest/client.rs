use crate::auth;
use crate::config::{Config, Credentials};
use crate::error::{OkexError, Result};
use crate::types::*;
use log::{debug, trace};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as HttpClient, Method, Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

const SPOT_ACCOUNTS: &str = "/api/spot/v3/accounts";
const SPOT_ORDERS_PENDING: &str = "/api/spot/v3/orders_pending";
const SPOT_FILLS: &str = "/api/spot/v3/fills";
const SPOT_INSTRUMENTS: &str = "/api/spot/v3/instruments";
const SPOT_TICKERS: &str = "/api/spot/v3/instruments/ticker";

/// A client for the exchange's read-only spot REST endpoints.
///
/// Public market data needs no credentials. Account endpoints sign each request
/// with the credentials from [`Config`].
///
/// # Examples
///
/// ```no_run
/// use okex_connector_rs::config::Config;
/// use okex_connector_rs::rest::Client;
///
/// #[tokio::main]
/// async fn main() {
///     let client = Client::new(&Config::default()).expect("Failed to create client");
///     let ticker = client.get_spot_ticker("BTC-USDT").await.expect("Failed to get ticker");
///     println!("last {}", ticker.last);
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    http_client: HttpClient,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl Client {
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = Url::parse(&config.endpoint)?;
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            credentials: config.credentials.clone(),
        })
    }

    /// Builds a request signed with the `OK-ACCESS-*` headers. `path` includes
    /// the query string, which is part of what gets signed.
    fn build_signed_request(&self, method: Method, path: &str) -> Result<Request> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            OkexError::AuthenticationError(format!("{} requires API credentials", path))
        })?;
        let timestamp = auth::get_iso_time();
        let signature = auth::sign_request(&creds.secret_key, &timestamp, method.as_str(), path, "")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("ok-access-key"),
            HeaderValue::from_str(&creds.api_key)?,
        );
        headers.insert(
            HeaderName::from_static("ok-access-sign"),
            HeaderValue::from_str(&signature)?,
        );
        headers.insert(
            HeaderName::from_static("ok-access-timestamp"),
            HeaderValue::from_str(&timestamp)?,
        );
        headers.insert(
            HeaderName::from_static("ok-access-passphrase"),
            HeaderValue::from_str(&creds.passphrase)?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let url = self.base_url.join(path)?;
        Ok(self.http_client.request(method, url).headers(headers).build()?)
    }

    fn build_public_request(&self, path: &str) -> Result<Request> {
        let url = self.base_url.join(path)?;
        Ok(self.http_client.get(url).build()?)
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.build_signed_request(Method::GET, path)?;
        self.send(request).await
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.build_public_request(path)?;
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        debug!("{} {}", request.method(), request.url());
        let response = self.http_client.execute(request).await?;
        Self::handle_response(response).await
    }

    /// Parses a success body into `T`, or the exchange error body into
    /// [`OkexError::ClientError`] / [`OkexError::ServerError`].
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let body = response.text().await?;
            trace!("Response body: {}", body);
            return Ok(serde_json::from_str(&body)?);
        }

        let (body, code, message) = match response.json::<serde_json::Value>().await {
            Ok(raw) => {
                let parsed: ApiErrorBody =
                    serde_json::from_value(raw.clone()).unwrap_or_default();
                let message = parsed
                    .message()
                    .unwrap_or("Unknown error message")
                    .to_string();
                (Some(raw), parsed.code(), message)
            }
            Err(_) => (
                None,
                0,
                format!(
                    "Request failed with status {} (could not parse error body)",
                    status
                ),
            ),
        };

        if status.is_client_error() {
            Err(OkexError::ClientError {
                status,
                code,
                message,
                data: body,
                header: headers,
            })
        } else {
            Err(OkexError::ServerError {
                status,
                code,
                message,
                header: headers,
            })
        }
    }

    // --- Account Endpoints ---

    /// Balances of every currency in the spot account.
    /// Corresponds to GET /api/spot/v3/accounts
    pub async fn get_spot_accounts(&self) -> Result<Vec<SpotAccount>> {
        self.get_signed(SPOT_ACCOUNTS).await
    }

    /// Corresponds to GET /api/spot/v3/accounts/{currency}
    pub async fn get_spot_account(&self, currency: &str) -> Result<SpotAccount> {
        let path = format!("{}/{}", SPOT_ACCOUNTS, currency);
        self.get_signed(&path).await
    }

    /// Balance changes of one currency, newest first.
    /// Corresponds to GET /api/spot/v3/accounts/{currency}/ledger
    pub async fn get_spot_ledger(
        &self,
        currency: &str,
        params: Option<GetLedgerParams>,
    ) -> Result<Vec<LedgerEntry>> {
        let path = with_query(&format!("{}/{}/ledger", SPOT_ACCOUNTS, currency), params.as_ref())?;
        self.get_signed(&path).await
    }

    /// Corresponds to GET /api/spot/v3/orders_pending
    pub async fn get_spot_orders_pending(
        &self,
        params: GetPendingOrdersParams<'_>,
    ) -> Result<Vec<SpotOrder>> {
        let path = with_query(SPOT_ORDERS_PENDING, Some(&params))?;
        self.get_signed(&path).await
    }

    /// Corresponds to GET /api/spot/v3/fills
    pub async fn get_spot_fills(&self, params: GetFillsParams<'_>) -> Result<Vec<SpotFill>> {
        let path = with_query(SPOT_FILLS, Some(&params))?;
        self.get_signed(&path).await
    }

    // --- Market Data Endpoints ---

    /// Corresponds to GET /api/spot/v3/instruments
    pub async fn get_spot_instruments(&self) -> Result<Vec<SpotInstrument>> {
        self.get_public(SPOT_INSTRUMENTS).await
    }

    /// Corresponds to GET /api/spot/v3/instruments/{instrument_id}/book
    pub async fn get_spot_book(
        &self,
        instrument_id: &str,
        params: Option<GetBookParams>,
    ) -> Result<BookResponse> {
        let path = with_query(
            &format!("{}/{}/book", SPOT_INSTRUMENTS, instrument_id),
            params.as_ref(),
        )?;
        self.get_public(&path).await
    }

    /// Corresponds to GET /api/spot/v3/instruments/ticker
    pub async fn get_spot_tickers(&self) -> Result<Vec<SpotTicker>> {
        self.get_public(SPOT_TICKERS).await
    }

    /// Corresponds to GET /api/spot/v3/instruments/{instrument_id}/ticker
    pub async fn get_spot_ticker(&self, instrument_id: &str) -> Result<SpotTicker> {
        let path = format!("{}/{}/ticker", SPOT_INSTRUMENTS, instrument_id);
        self.get_public(&path).await
    }

    /// Corresponds to GET /api/spot/v3/instruments/{instrument_id}/trades
    pub async fn get_spot_trades(
        &self,
        instrument_id: &str,
        params: Option<GetTradesParams>,
    ) -> Result<Vec<SpotTrade>> {
        let path = with_query(
            &format!("{}/{}/trades", SPOT_INSTRUMENTS, instrument_id),
            params.as_ref(),
        )?;
        self.get_public(&path).await
    }

    /// Corresponds to GET /api/spot/v3/instruments/{instrument_id}/candles
    pub async fn get_spot_candles(
        &self,
        instrument_id: &str,
        params: Option<GetCandlesParams>,
    ) -> Result<Vec<Candle>> {
        let path = with_query(
            &format!("{}/{}/candles", SPOT_INSTRUMENTS, instrument_id),
            params.as_ref(),
        )?;
        self.get_public(&path).await
    }
}

/// Appends the serialized params to `path`, or returns it unchanged when there
/// are none to send.
fn with_query<P: Serialize>(path: &str, params: Option<&P>) -> Result<String> {
    let query = match params {
        Some(p) => serde_qs::to_string(p)?,
        None => String::new(),
    };
    if query.is_empty() {
        Ok(path.to_string())
    } else {
        Ok(format!("{}?{}", path, query))
    }
}
