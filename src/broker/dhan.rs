// =============================================================================
// DhanHQ REST API client — order placement, trade book, fund limits
// =============================================================================
//
// SECURITY: the access token is sent as a header and never logged or
// serialised. All requests carry a 10-second timeout so a stalled broker
// call can never wedge the risk loop's caller.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::types::{Segment, Side};

/// Request timeout for every broker call.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Order-placement failure, split by what it means for retries: a rejection
/// is the broker's final decision; a transport failure never reached one and
/// is safe to retry.
#[derive(Debug, Error)]
pub enum DhanError {
    /// The broker processed the request and refused the order.
    #[error("order rejected ({status}): {message}")]
    Rejected { status: String, message: String },
    /// The request failed before a broker decision was obtained.
    #[error("broker transport failure: {0}")]
    Transport(String),
}

/// Seam between the live broker and the exchange API, so execution logic
/// tests against a fake gateway the way wallet/position tests run against
/// the in-memory store.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Client id stamped into order bodies.
    fn client_id(&self) -> &str;

    /// Submit one order request for a single broker decision.
    async fn place_order(
        &self,
        request: &DhanOrderRequest,
    ) -> std::result::Result<DhanOrderResponse, DhanError>;

    /// Average fill price from the trade book, when any trades have printed.
    async fn trade_avg_price(&self, order_id: &str) -> Result<Option<f64>>;
}

/// Order request body, field-for-field the broker's wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhanOrderRequest {
    pub dhan_client_id: String,
    pub transaction_type: String,
    pub exchange_segment: String,
    pub product_type: String,
    pub order_type: String,
    pub validity: String,
    pub security_id: String,
    pub quantity: i64,
}

impl DhanOrderRequest {
    /// Intraday market order with the engine's fixed product settings.
    pub fn market(client_id: &str, side: Side, segment: Segment, security_id: &str, quantity: i64) -> Self {
        Self {
            dhan_client_id: client_id.to_string(),
            transaction_type: side.to_string(),
            exchange_segment: segment.to_string(),
            product_type: "MARGIN".to_string(),
            order_type: "MARKET".to_string(),
            validity: "DAY".to_string(),
            security_id: security_id.to_string(),
            quantity,
        }
    }
}

/// Order placement acknowledgement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhanOrderResponse {
    pub order_id: String,
    #[serde(default)]
    pub order_status: String,
}

/// DhanHQ REST client.
#[derive(Clone)]
pub struct DhanClient {
    client_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl DhanClient {
    /// Create a new client. The access token becomes a default header on
    /// every request; `client_id` rides in order bodies.
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        let access_token = access_token.into();

        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&access_token) {
            headers.insert("access-token", value);
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client_id: client_id.into(),
            base_url: "https://api.dhan.co/v2".to_string(),
            client,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /orders. A non-success status is the broker's final word and
    /// maps to [`DhanError::Rejected`]; anything short of a decision maps to
    /// [`DhanError::Transport`].
    #[instrument(skip(self, request), name = "dhan::place_order")]
    pub async fn place_order(
        &self,
        request: &DhanOrderRequest,
    ) -> std::result::Result<DhanOrderResponse, DhanError> {
        let url = format!("{}/orders", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| DhanError::Transport(format!("POST /orders request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DhanError::Transport(format!("failed to parse order response: {e}")))?;

        if !status.is_success() {
            let message = body
                .get("errorMessage")
                .or_else(|| body.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown broker error");
            return Err(DhanError::Rejected {
                status: status.to_string(),
                message: message.to_string(),
            });
        }

        let parsed: DhanOrderResponse = serde_json::from_value(body)
            .map_err(|e| DhanError::Transport(format!("order response missing orderId: {e}")))?;
        debug!(order_id = %parsed.order_id, status = %parsed.order_status, "order placed");
        Ok(parsed)
    }

    /// GET /trades/{order_id} — average fill price across the order's
    /// trades, when any have been reported yet.
    #[instrument(skip(self), name = "dhan::trade_avg_price")]
    pub async fn trade_avg_price(&self, order_id: &str) -> Result<Option<f64>> {
        let url = format!("{}/trades/{order_id}", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /trades request failed")?;

        if !resp.status().is_success() {
            warn!(order_id, status = %resp.status(), "trade book lookup failed");
            return Ok(None);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse trade book response")?;

        let trades = match body.as_array() {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(None),
        };

        let mut qty_total = 0.0;
        let mut notional = 0.0;
        for trade in trades {
            let qty = trade
                .get("tradedQuantity")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let price = trade
                .get("tradedPrice")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            qty_total += qty;
            notional += qty * price;
        }

        if qty_total > 0.0 {
            Ok(Some(notional / qty_total))
        } else {
            Ok(None)
        }
    }

    // -------------------------------------------------------------------------
    // Funds
    // -------------------------------------------------------------------------

    /// GET /fundlimit — withdrawable balance. The broker's field is spelled
    /// `availabelBalance` on the wire; both spellings are accepted.
    #[instrument(skip(self), name = "dhan::fund_limit")]
    pub async fn available_balance(&self) -> Result<f64> {
        let url = format!("{}/fundlimit", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fundlimit request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse fund limit response")?;

        if !status.is_success() {
            anyhow::bail!("fund limit request returned {status}: {body}");
        }

        body.get("availabelBalance")
            .or_else(|| body.get("availableBalance"))
            .and_then(|v| v.as_f64())
            .context("fund limit response missing balance field")
    }
}

#[async_trait]
impl OrderGateway for DhanClient {
    fn client_id(&self) -> &str {
        DhanClient::client_id(self)
    }

    async fn place_order(
        &self,
        request: &DhanOrderRequest,
    ) -> std::result::Result<DhanOrderResponse, DhanError> {
        DhanClient::place_order(self, request).await
    }

    async fn trade_avg_price(&self, order_id: &str) -> Result<Option<f64>> {
        DhanClient::trade_avg_price(self, order_id).await
    }
}

impl std::fmt::Debug for DhanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhanClient")
            .field("client_id", &self.client_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}
