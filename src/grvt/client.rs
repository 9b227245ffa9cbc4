// =============================================================================
// GRVT REST API Client — session-cookie auth, typed operations, retries
// =============================================================================
//
// Data endpoints live on the trading base (`/full/v1/...`), funds movement on
// the edge base. Authentication is a `gravity` session cookie obtained from
// the api-key login endpoint; `create_order` additionally requires a warm-up
// authenticated call immediately beforehand so the cookie in client state is
// fresh.
//
// SECURITY: api keys and cookies are never logged or serialised.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::alerts::AlertSink;
use crate::grvt::signing::WireSignature;
use crate::retry::{with_retries, Backoff};
use crate::types::{Env, Instrument, Observation, Position};

/// Timeout applied to every HTTP round-trip.
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Read endpoints: 4 attempts, exponential delay capped at 8 s.
const READ_ATTEMPTS: u32 = 4;
const READ_BACKOFF: Backoff = Backoff::ExponentialSecs { cap_secs: 8 };

/// Transfers: 3 attempts, 1.5 s · 1.5^n.
const TRANSFER_ATTEMPTS: u32 = 3;
const TRANSFER_BACKOFF: Backoff = Backoff::GeometricMs { base_ms: 1500 };

/// Business error code the venue uses for transient transfer rejections.
const CODE_TRANSFER_TRANSIENT: i64 = 1006;

// =============================================================================
// Errors
// =============================================================================

/// Typed client error distinguishing the retry classes.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network, timeout or decode failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Structured error returned by the exchange.
    #[error("exchange error code={code} status={status}: {message}")]
    Business {
        code: i64,
        status: u16,
        message: String,
    },

    /// Locally detected bad input (missing creds, malformed key, bad size).
    #[error("validation error: {0}")]
    Validation(String),
}

impl ClientError {
    /// Transfers retry on transient business code 1006, HTTP 429, and any
    /// transport failure; every other business error is terminal.
    pub fn transfer_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Business { code, status, .. } => {
                *code == CODE_TRANSFER_TRANSIENT || *status == 429
            }
            Self::Validation(_) => false,
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Signed transfer request, ready for `/full/v1/transfer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: String,
    pub from_sub_account_id: String,
    pub to_account_id: String,
    pub to_sub_account_id: String,
    pub currency: String,
    /// Fixed 6-decimal string.
    pub num_tokens: String,
    pub signature: WireSignature,
    pub transfer_type: String,
    pub transfer_metadata: String,
}

/// Acknowledgement for a transfer hop.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferAck {
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub tx_id: Option<String>,
}

/// One leg of an order on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLegWire {
    pub instrument: String,
    pub size: String,
    /// Absent for market orders.
    pub limit_price: Option<String>,
    pub is_buying_asset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMetadataWire {
    pub client_order_id: String,
}

/// Signed order payload, ready for `/full/v1/create_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub sub_account_id: String,
    pub is_market: bool,
    pub time_in_force: String,
    pub post_only: bool,
    pub reduce_only: bool,
    pub legs: Vec<OrderLegWire>,
    pub signature: WireSignature,
    pub metadata: OrderMetadataWire,
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope<T> {
    result: T,
}

#[derive(Debug, Default, Deserialize)]
struct SummaryResult {
    #[serde(default)]
    total_equity: Decimal,
    #[serde(default, alias = "maint_margin")]
    maintenance_margin: Decimal,
    #[serde(default)]
    available_balance: Decimal,
    #[serde(default)]
    event_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FundingSummaryResult {
    #[serde(default)]
    spot_balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    #[serde(default)]
    currency: String,
    #[serde(default)]
    balance: Decimal,
}

// =============================================================================
// Exchange trait — the seam the engines talk through
// =============================================================================

/// Typed operations over the signed wire. Read operations absorb retries and
/// degrade to zero/empty defaults (dispatching a one-shot warning) so a
/// flapping API never panics an engine mid-pass.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Equity / margin / available for one trading sub-account.
    async fn sub_account_summary(&self, sub_id: &str) -> Observation;

    /// Funding-wallet balance for `currency` (zero when absent).
    async fn funding_usdt_balance(&self, currency: &str) -> Decimal;

    /// Open perpetual positions for one trading sub-account.
    async fn positions(&self, sub_id: &str) -> Vec<Position>;

    /// Instrument metadata, cached after first fetch.
    async fn get_instrument(&self, instrument: &str) -> Result<Instrument, ClientError>;

    /// Execute one signed transfer hop (retried per the transfer policy).
    async fn transfer(&self, req: TransferRequest) -> Result<TransferAck, ClientError>;

    /// Place one signed order. Single attempt; retry is the caller's call.
    async fn create_order(&self, order: OrderPayload) -> Result<serde_json::Value, ClientError>;
}

// =============================================================================
// Client
// =============================================================================

/// GRVT REST client bound to one credential set.
pub struct GrvtClient {
    env: Env,
    api_key: String,
    /// Value of the `X-Grvt-Account-Id` header (trading sub-account or main
    /// account id depending on role).
    account_id: String,
    /// Diagnostic label, e.g. "A.trading".
    label: String,
    http: reqwest::Client,
    cookie: RwLock<Option<String>>,
    instruments: RwLock<HashMap<String, Instrument>>,
    alerts: Arc<AlertSink>,
}

/// Pull the `gravity` session cookie out of a login response's Set-Cookie
/// headers.
pub fn extract_gravity_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let cookie = cookie.trim();
            cookie
                .strip_prefix("gravity=")
                .map(|rest| rest.split(';').next().unwrap_or(rest).to_string())
        })
        .filter(|v| !v.is_empty())
}

impl GrvtClient {
    pub fn new(env: Env, api_key: impl Into<String>, account_id: impl Into<String>, label: impl Into<String>, alerts: Arc<AlertSink>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            env,
            api_key: api_key.into(),
            account_id: account_id.into(),
            label: label.into(),
            http,
            cookie: RwLock::new(None),
            instruments: RwLock::new(HashMap::new()),
            alerts,
        }
    }

    // -------------------------------------------------------------------------
    // Session handling
    // -------------------------------------------------------------------------

    /// Log in with the api key and capture the `gravity` session cookie.
    async fn login(&self) -> Result<String, ClientError> {
        let url = format!("{}/auth/api_key/login", self.env.edge_base());
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "api_key": self.api_key }))
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("login request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Business {
                code: -1,
                status: status.as_u16(),
                message: "api key login rejected".to_string(),
            });
        }

        let cookie = extract_gravity_cookie(resp.headers()).ok_or_else(|| {
            ClientError::Transport("login response carried no gravity cookie".to_string())
        })?;

        debug!(label = %self.label, "session cookie refreshed");
        *self.cookie.write() = Some(cookie.clone());
        Ok(cookie)
    }

    async fn ensure_session(&self) -> Result<String, ClientError> {
        if let Some(cookie) = self.cookie.read().clone() {
            return Ok(cookie);
        }
        self.login().await
    }

    /// The cookie currently held in client state, if any.
    pub fn session_cookie(&self) -> Option<String> {
        self.cookie.read().clone()
    }

    // -------------------------------------------------------------------------
    // Signed POST plumbing
    // -------------------------------------------------------------------------

    async fn post_signed(
        &self,
        base: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let cookie = self.ensure_session().await?;
        let url = format!("{base}{path}");

        let resp = self
            .http
            .post(&url)
            .header("Cookie", format!("gravity={cookie}"))
            .header("X-Grvt-Account-Id", &self.account_id)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("POST {path} failed: {e}")))?;

        let status = resp.status();

        // A rejected session is cleared so the next call re-authenticates.
        if status.as_u16() == 401 {
            *self.cookie.write() = None;
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("decoding {path} response: {e}")))?;

        if !status.is_success() || json.get("code").is_some() {
            return Err(ClientError::Business {
                code: json.get("code").and_then(|v| v.as_i64()).unwrap_or(-1),
                status: status.as_u16(),
                message: json
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown exchange error")
                    .to_string(),
            });
        }

        Ok(json)
    }

    fn decode<T: serde::de::DeserializeOwned>(
        path: &str,
        json: serde_json::Value,
    ) -> Result<T, ClientError> {
        serde_json::from_value::<ResultEnvelope<T>>(json)
            .map(|env| env.result)
            .map_err(|e| ClientError::Transport(format!("unexpected {path} payload: {e}")))
    }

    // -------------------------------------------------------------------------
    // Raw single-attempt operations
    // -------------------------------------------------------------------------

    async fn raw_sub_account_summary(&self, sub_id: &str) -> Result<Observation, ClientError> {
        let json = self
            .post_signed(
                self.env.trading_base(),
                "/full/v1/account_summary",
                &serde_json::json!({ "sub_account_id": sub_id }),
            )
            .await?;
        let result: SummaryResult = Self::decode("account_summary", json)?;
        Ok(Observation {
            total_equity: result.total_equity,
            maintenance_margin: result.maintenance_margin,
            available_balance: result.available_balance,
            event_time_ns: result.event_time.and_then(|s| i64::from_str(&s).ok()),
        })
    }

    async fn raw_funding_usdt_balance(&self, currency: &str) -> Result<Decimal, ClientError> {
        let json = self
            .post_signed(
                self.env.edge_base(),
                "/full/v1/funding_account_summary",
                &serde_json::json!({}),
            )
            .await?;
        let result: FundingSummaryResult = Self::decode("funding_account_summary", json)?;
        Ok(result
            .spot_balances
            .iter()
            .find(|b| b.currency == currency)
            .map(|b| b.balance)
            .unwrap_or_default())
    }

    async fn raw_positions(&self, sub_id: &str) -> Result<Vec<Position>, ClientError> {
        let json = self
            .post_signed(
                self.env.trading_base(),
                "/full/v1/positions",
                &serde_json::json!({ "sub_account_id": sub_id, "kind": ["PERPETUAL"] }),
            )
            .await?;
        Self::decode("positions", json)
    }

    async fn raw_instrument(&self, instrument: &str) -> Result<Instrument, ClientError> {
        let json = self
            .post_signed(
                self.env.trading_base(),
                "/full/v1/instrument",
                &serde_json::json!({ "instrument": instrument }),
            )
            .await?;
        Self::decode("instrument", json)
    }

    async fn exhausted(&self, op: &str, err: &ClientError) {
        warn!(label = %self.label, op, error = %err, "retries exhausted, returning default");
        self.alerts
            .dispatch_warning(serde_json::json!({
                "error": format!("{op}_error"),
                "account": self.account_id,
                "exception": err.to_string(),
                "retries_exhausted": true,
            }))
            .await;
    }
}

#[async_trait]
impl ExchangeApi for GrvtClient {
    async fn sub_account_summary(&self, sub_id: &str) -> Observation {
        let result = with_retries(
            "sub_account_summary",
            READ_ATTEMPTS,
            READ_BACKOFF,
            |_| true,
            || self.raw_sub_account_summary(sub_id),
        )
        .await;
        match result {
            Ok(obs) => obs,
            Err(e) => {
                self.exhausted("trading_summary", &e).await;
                Observation::default()
            }
        }
    }

    async fn funding_usdt_balance(&self, currency: &str) -> Decimal {
        let result = with_retries(
            "funding_usdt_balance",
            READ_ATTEMPTS,
            READ_BACKOFF,
            |_| true,
            || self.raw_funding_usdt_balance(currency),
        )
        .await;
        match result {
            Ok(balance) => balance,
            Err(e) => {
                self.exhausted("funding_balance", &e).await;
                Decimal::ZERO
            }
        }
    }

    async fn positions(&self, sub_id: &str) -> Vec<Position> {
        let result = with_retries(
            "positions",
            READ_ATTEMPTS,
            READ_BACKOFF,
            |_| true,
            || self.raw_positions(sub_id),
        )
        .await;
        match result {
            Ok(positions) => positions,
            Err(e) => {
                self.exhausted("positions_fetch", &e).await;
                Vec::new()
            }
        }
    }

    async fn get_instrument(&self, instrument: &str) -> Result<Instrument, ClientError> {
        if let Some(cached) = self.instruments.read().get(instrument).cloned() {
            return Ok(cached);
        }
        let fetched = with_retries(
            "get_instrument",
            READ_ATTEMPTS,
            READ_BACKOFF,
            |_| true,
            || self.raw_instrument(instrument),
        )
        .await?;
        self.instruments
            .write()
            .insert(instrument.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn transfer(&self, req: TransferRequest) -> Result<TransferAck, ClientError> {
        let body = serde_json::to_value(&req)
            .map_err(|e| ClientError::Transport(format!("encoding transfer request: {e}")))?;
        let body_ref = &body;
        let result = with_retries(
            "transfer",
            TRANSFER_ATTEMPTS,
            TRANSFER_BACKOFF,
            ClientError::transfer_retryable,
            move || async move {
                let json = self
                    .post_signed(self.env.edge_base(), "/full/v1/transfer", body_ref)
                    .await?;
                Self::decode::<TransferAck>("transfer", json)
            },
        )
        .await;

        if let Err(e) = &result {
            warn!(label = %self.label, error = %e, "transfer failed after retries");
        }
        result
    }

    async fn create_order(&self, order: OrderPayload) -> Result<serde_json::Value, ClientError> {
        // Warm-up: an authenticated call refreshes the session so the cookie
        // extracted below is valid for the direct create_order POST.
        if let Err(e) = self.raw_sub_account_summary(&order.sub_account_id).await {
            warn!(label = %self.label, error = %e, "create_order warm-up call failed");
        }
        let cookie = self
            .session_cookie()
            .ok_or_else(|| ClientError::Validation("no gravity session cookie".to_string()))?;

        let url = format!("{}/full/v1/create_order", self.env.trading_base());
        let body = serde_json::json!({ "order": &order });

        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Grvt-Account-Id", &order.sub_account_id)
            .header("Cookie", format!("gravity={cookie}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("POST create_order failed: {e}")))?;

        let status = resp.status();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("decoding create_order response: {e}")))?;

        if !status.is_success() || json.get("code").is_some() {
            return Err(ClientError::Business {
                code: json.get("code").and_then(|v| v.as_i64()).unwrap_or(-1),
                status: status.as_u16(),
                message: json.to_string(),
            });
        }

        debug!(label = %self.label, "order placed");
        Ok(json)
    }
}

impl std::fmt::Debug for GrvtClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrvtClient")
            .field("env", &self.env)
            .field("label", &self.label)
            .field("api_key", &"<redacted>")
            .field("cookie", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Account handle — creds plus the two clients acting for them
// =============================================================================

/// One side of the hedged pair: its credentials, a client authenticated for
/// the trading sub-account, and one for the funding wallet.
#[derive(Clone)]
pub struct GrvtAccount {
    pub side: crate::types::AccountSide,
    pub creds: crate::config::AccountCreds,
    pub trading: Arc<dyn ExchangeApi>,
    pub funding: Arc<dyn ExchangeApi>,
}

impl GrvtAccount {
    /// Build live clients for `creds`.
    pub fn connect(
        side: crate::types::AccountSide,
        creds: crate::config::AccountCreds,
        env: Env,
        alerts: Arc<AlertSink>,
    ) -> Self {
        let trading = Arc::new(GrvtClient::new(
            env,
            creds.trading_api_key(),
            creds.trading_account_id.clone(),
            format!("{side}.trading"),
            alerts.clone(),
        ));
        let funding_account_id = if creds.account_id.is_empty() {
            creds.trading_account_id.clone()
        } else {
            creds.account_id.clone()
        };
        let funding = Arc::new(GrvtClient::new(
            env,
            creds.funding_key.clone(),
            funding_account_id,
            format!("{side}.funding"),
            alerts,
        ));
        Self {
            side,
            creds,
            trading,
            funding,
        }
    }

    /// Wire clients supplied by the caller (used by tests and tooling).
    pub fn with_clients(
        side: crate::types::AccountSide,
        creds: crate::config::AccountCreds,
        trading: Arc<dyn ExchangeApi>,
        funding: Arc<dyn ExchangeApi>,
    ) -> Self {
        Self {
            side,
            creds,
            trading,
            funding,
        }
    }

    pub fn trading_sub_id(&self) -> &str {
        &self.creds.trading_account_id
    }
}

impl std::fmt::Debug for GrvtAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrvtAccount")
            .field("side", &self.side)
            .field("trading_sub_id", &self.creds.trading_account_id)
            .finish()
    }
}
