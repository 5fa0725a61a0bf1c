// =============================================================================
// REST adapter — HMAC-SHA256 signed exchange client
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry the API key as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the venue.
// =============================================================================

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::{now_ms, Direction};

use super::{Adapter, BrokerPosition, OrderAck, OrderRequest, OrderState, OrderType};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Signed REST client for the live venue.
pub struct RestAdapter {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_call(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("{method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    fn parse_ack(body: &serde_json::Value) -> Result<OrderAck> {
        let order_id = body
            .get("orderId")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .ok_or_else(|| anyhow!("order response missing orderId: {body}"))?;

        let state = match body.get("status").and_then(|v| v.as_str()).unwrap_or("NEW") {
            "FILLED" => OrderState::Filled,
            "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderState::Canceled,
            "REJECTED" => OrderState::Rejected,
            _ => OrderState::New,
        };

        let filled_size = body
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);

        let avg_fill_price = body
            .get("avgPrice")
            .or_else(|| body.get("price"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .filter(|p| *p > Decimal::ZERO);

        Ok(OrderAck {
            order_id,
            state,
            filled_size,
            avg_fill_price,
        })
    }
}

#[async_trait]
impl Adapter for RestAdapter {
    #[instrument(skip(self, request), fields(signal_id = %request.signal_id, symbol = %request.symbol))]
    async fn send_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={}&side={}&quantity={}&newClientOrderId={}",
            request.symbol, request.side, request.size, request.client_order_id
        );
        match request.order_type {
            OrderType::Limit => {
                let price = request
                    .price
                    .ok_or_else(|| anyhow!("LIMIT order without a price"))?;
                // Post-only maps to the venue's maker-or-cancel time in force.
                let tif = if request.post_only { "GTX" } else { "GTC" };
                params.push_str(&format!("&type=LIMIT&price={price}&timeInForce={tif}"));
            }
            OrderType::Market => params.push_str("&type=MARKET"),
        }
        if request.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!("placing order");
        let body = self
            .signed_call(reqwest::Method::POST, "/api/v3/order", &params)
            .await?;
        Self::parse_ack(&body)
    }

    #[instrument(skip(self))]
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderAck> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .signed_call(reqwest::Method::GET, "/api/v3/order", &params)
            .await?;
        Self::parse_ack(&body)
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .signed_call(reqwest::Method::DELETE, "/api/v3/order", &params)
            .await?;
        Self::parse_ack(&body)
    }

    #[instrument(skip(self, stop))]
    async fn update_stop_loss(&self, symbol: &str, stop: Decimal) -> Result<()> {
        let params = format!("symbol={symbol}&stopPrice={stop}");
        self.signed_call(reqwest::Method::POST, "/api/v3/order/stop", &params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, take_profits))]
    async fn update_take_profit(&self, symbol: &str, take_profits: &[Decimal]) -> Result<()> {
        let levels = take_profits
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let params = format!("symbol={symbol}&takeProfits={levels}");
        self.signed_call(reqwest::Method::POST, "/api/v3/order/takeProfit", &params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let body = self
            .signed_call(reqwest::Method::GET, "/api/v3/positions", "")
            .await?;
        let raw = body
            .as_array()
            .context("positions response is not an array")?;

        let mut positions = Vec::with_capacity(raw.len());
        for entry in raw {
            let symbol = entry
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let size = entry
                .get("positionAmt")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Decimal>().ok())
                .unwrap_or(Decimal::ZERO);
            if size == Decimal::ZERO {
                continue;
            }
            let entry_price = entry
                .get("entryPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Decimal>().ok())
                .unwrap_or(Decimal::ZERO);
            let direction = if size > Decimal::ZERO {
                Direction::Long
            } else {
                Direction::Short
            };
            positions.push(BrokerPosition {
                symbol,
                direction,
                size: size.abs(),
                entry_price,
            });
        }
        debug!(count = positions.len(), "broker positions fetched");
        Ok(positions)
    }

    #[instrument(skip(self))]
    async fn close_position(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        self.signed_call(reqwest::Method::POST, "/api/v3/position/close", &params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn close_all_positions(&self) -> Result<u32> {
        let body = self
            .signed_call(reqwest::Method::POST, "/api/v3/position/closeAll", "")
            .await?;
        let count = body
            .get("closed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if count > 0 {
            warn!(count, "broker flattened positions");
        }
        Ok(count)
    }

    async fn test_connection(&self) -> Result<()> {
        self.signed_call(reqwest::Method::GET, "/api/v3/account", "")
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for RestAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAdapter")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
