use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{Quota, RateLimiter};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::InstrumentCatalog;
use crate::config::BrokerConfig;
use crate::error::{EngineError, GatewayError};
use crate::feed::QuoteSource;
use crate::gateway::OrderGateway;
use crate::models::{
    Instrument, OptionKind, OrderId, OrderKind, OrderRequest, OrderState, OrderStatus,
};

const MAX_RETRIES: u32 = 3;

type UpstoxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Standard response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OptionContract {
    instrument_key: String,
    #[serde(default)]
    trading_symbol: Option<String>,
    strike_price: f64,
    instrument_type: String,
    expiry: NaiveDate,
    lot_size: u32,
    #[serde(default)]
    underlying_symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LtpQuote {
    last_price: f64,
    #[serde(default)]
    instrument_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    quantity: u32,
    product: &'a str,
    validity: &'a str,
    price: f64,
    tag: &'a str,
    instrument_token: &'a str,
    order_type: &'a str,
    transaction_type: String,
    disclosed_quantity: u32,
    trigger_price: f64,
    is_amo: bool,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderDetails {
    status: String,
    #[serde(default)]
    average_price: Option<f64>,
}

/// Map a broker order status string onto the engine's order states
pub fn parse_order_state(status: &str) -> OrderState {
    match status.to_ascii_lowercase().as_str() {
        "complete" | "filled" | "traded" => OrderState::Filled,
        "cancelled" | "canceled" => OrderState::Cancelled,
        "rejected" => OrderState::Rejected,
        _ => OrderState::Pending,
    }
}

/// Upstox REST client: quotes, option contracts and order management
///
/// Cloneable; clones share the HTTP client and rate limiter. Read calls
/// retry on 429 / 5xx with exponential backoff. Order placement never
/// retries, since a lost response does not mean a lost order.
#[derive(Clone)]
pub struct UpstoxClient {
    client: Client,
    base_url: String,
    access_token: String,
    product: String,
    rate_limiter: Arc<UpstoxRateLimiter>,
}

impl UpstoxClient {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let access_token = config
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .context("broker.access_token is required for the REST adapter")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token,
            product: config.product.clone(),
            rate_limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
    }

    /// Rate-limited GET with retry on throttling and server errors
    async fn get_with_retry(&self, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        let url = self.url(path);
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.authed(self.client.get(&url).query(query)).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
                        && attempt < MAX_RETRIES
                    {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            %status,
                            path,
                            attempt,
                            backoff_secs,
                            "Upstox request failed, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("Upstox {} returned {}: {}", path, status, body);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::warn!(error = %e, path, attempt, "Upstox request error, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Err(e) => return Err(e).context(format!("Upstox request to {} failed", path)),
            }
        }
        anyhow::bail!("Upstox {} failed after {} attempts", path, MAX_RETRIES)
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self.get_with_retry(path, query).await?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", path))?;
        unwrap_envelope(envelope).map_err(|msg| anyhow::anyhow!("{}: {}", path, msg))
    }

    /// Option contracts listed for an index instrument key
    pub async fn option_contracts(&self, index_key: &str) -> Result<Vec<Instrument>> {
        let rows: Vec<OptionContract> = self
            .get_data("/v2/option/contract", &[("instrument_key", index_key)])
            .await?;

        let contracts = rows
            .into_iter()
            .filter_map(|c| {
                let kind = match c.instrument_type.as_str() {
                    "CE" => OptionKind::Call,
                    "PE" => OptionKind::Put,
                    _ => return None,
                };
                Some(Instrument {
                    id: c.instrument_key,
                    symbol: c.trading_symbol,
                    underlying: c.underlying_symbol.unwrap_or_default(),
                    kind,
                    strike: c.strike_price,
                    expiry: c.expiry,
                    lot_size: c.lot_size,
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(index_key, contracts = contracts.len(), "Fetched option contracts");
        Ok(contracts)
    }

    /// Last traded prices keyed by the requested instrument keys
    pub async fn ltp(&self, keys: &[String]) -> Result<HashMap<String, f64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = keys.join(",");
        let quotes: HashMap<String, LtpQuote> = self
            .get_data("/v2/market-quote/ltp", &[("instrument_key", joined.as_str())])
            .await?;

        Ok(quotes
            .into_iter()
            .map(|(key, quote)| {
                // response keys use "SEG:SYMBOL"; the token field carries the request key
                let id = quote.instrument_token.unwrap_or(key);
                (id, quote.last_price)
            })
            .collect())
    }

    async fn read_gateway<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> std::result::Result<T, GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_client_error() {
            return Err(GatewayError::Rejected(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(GatewayError::Transport(format!("{}: {}", status, body)));
        }
        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Transport(format!("bad response body: {}", e)))?;
        unwrap_envelope(envelope).map_err(GatewayError::Rejected)
    }

    /// Catalog view over one index's option chain
    pub fn catalog(&self, index_key: impl Into<String>) -> UpstoxCatalog {
        UpstoxCatalog {
            client: self.clone(),
            index_key: index_key.into(),
        }
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> std::result::Result<T, String> {
    if envelope.status != "success" {
        let msg = envelope
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(format!("status '{}' {}", envelope.status, msg));
    }
    envelope.data.ok_or_else(|| "response has no data".to_string())
}

#[async_trait]
impl OrderGateway for UpstoxClient {
    async fn place(&self, request: &OrderRequest) -> std::result::Result<OrderId, GatewayError> {
        let (order_type, price, trigger_price) = match request.kind {
            OrderKind::Market => ("MARKET", 0.0, 0.0),
            OrderKind::Stop { trigger, limit } => ("SL", limit, trigger),
        };
        let body = PlaceOrderBody {
            quantity: request.quantity,
            product: &self.product,
            validity: "DAY",
            price,
            tag: "straddlebot",
            instrument_token: &request.instrument_id,
            order_type,
            transaction_type: request.side.to_string(),
            disclosed_quantity: 0,
            trigger_price,
            is_amo: false,
        };

        self.rate_limiter.until_ready().await;
        let response = self
            .authed(self.client.post(self.url("/v2/order/place")))
            .json(&body)
            .send()
            .await?;
        let order: OrderRef = self.read_gateway(response).await?;

        tracing::info!(
            order = %order.order_id,
            instrument = %request.instrument_id,
            side = %request.side,
            order_type,
            trigger_price,
            "Order placed"
        );
        Ok(OrderId(order.order_id))
    }

    async fn cancel(&self, order_id: &OrderId) -> std::result::Result<(), GatewayError> {
        self.rate_limiter.until_ready().await;
        let response = self
            .authed(self.client.delete(self.url("/v2/order/cancel")))
            .query(&[("order_id", order_id.0.as_str())])
            .send()
            .await?;
        let _: OrderRef = self.read_gateway(response).await?;
        Ok(())
    }

    async fn status(&self, order_id: &OrderId) -> std::result::Result<OrderStatus, GatewayError> {
        self.rate_limiter.until_ready().await;
        let response = self
            .authed(self.client.get(self.url("/v2/order/details")))
            .query(&[("order_id", order_id.0.as_str())])
            .send()
            .await?;
        let details: OrderDetails = self.read_gateway(response).await?;
        Ok(OrderStatus {
            state: parse_order_state(&details.status),
            avg_fill_price: details.average_price,
        })
    }
}

#[async_trait]
impl QuoteSource for UpstoxClient {
    async fn last_prices(&self, ids: &[String]) -> Result<HashMap<String, f64>> {
        self.ltp(ids).await
    }
}

/// `InstrumentCatalog` over the option-contract endpoint
#[derive(Clone)]
pub struct UpstoxCatalog {
    client: UpstoxClient,
    index_key: String,
}

#[async_trait]
impl InstrumentCatalog for UpstoxCatalog {
    async fn contracts(&self, underlying: &str) -> crate::error::Result<Vec<Instrument>> {
        let all = self
            .client
            .option_contracts(&self.index_key)
            .await
            .map_err(|e| EngineError::Catalog(format!("{:#}", e)))?;
        // rows without an underlying symbol are assumed to belong to the index
        Ok(all
            .into_iter()
            .filter(|c| c.underlying.is_empty() || c.underlying == underlying)
            .collect())
    }
}
