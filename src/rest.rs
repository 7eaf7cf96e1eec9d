//! Exchange REST surface: the level-3 order book used for book resets and
//! snapshots, and the recent-trades listing used for gap back-fill.
//!
//! The exchange drops idle authenticated sessions, so client freshness is a
//! property of the client: a connection older than 30 s is replaced before
//! the next call, transparently to callers. Each call retries up to three
//! times with a fresh client per retry and propagates the final failure.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

const RETRIES: u32 = 3;
const CLIENT_MAX_IDLE: Duration = Duration::from_secs(30);

/// The two endpoints the collector consumes. A trait so the gap-repair and
/// snapshot paths can be driven against a mock in tests.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Full level-3 order book for one product.
    async fn order_book(&self, product_id: &str) -> Result<Value>;

    /// Most recent trades for one product, newest first.
    async fn trades(&self, product_id: &str) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone, Default)]
pub struct RestCredentials {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

impl RestCredentials {
    fn is_configured(&self) -> bool {
        !self.key.is_empty()
    }
}

struct ClientState {
    client: reqwest::Client,
    last_call: Instant,
}

pub struct FeedRestClient {
    base_url: String,
    credentials: RestCredentials,
    state: Mutex<ClientState>,
}

impl FeedRestClient {
    pub fn new(base_url: &str, credentials: RestCredentials) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            state: Mutex::new(ClientState {
                client: build_client(),
                last_call: Instant::now(),
            }),
        }
    }

    /// Hand out the current client, replacing it first when it has sat idle
    /// past the session limit.
    fn fresh_client(&self) -> reqwest::Client {
        let mut state = self.state.lock();
        if state.last_call.elapsed() > CLIENT_MAX_IDLE {
            state.client = build_client();
        }
        state.last_call = Instant::now();
        state.client.clone()
    }

    fn replace_client(&self) {
        let mut state = self.state.lock();
        state.client = build_client();
        state.last_call = Instant::now();
    }

    fn auth_headers(&self, method: &str, path_with_query: &str) -> Result<Vec<(String, String)>> {
        if !self.credentials.is_configured() {
            return Ok(Vec::new());
        }
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let secret = BASE64
            .decode(&self.credentials.secret)
            .context("decoding api secret")?;
        let mut mac =
            HmacSha256::new_from_slice(&secret).context("building request signer")?;
        mac.update(format!("{timestamp}{method}{path_with_query}").as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        Ok(vec![
            ("CB-ACCESS-KEY".to_string(), self.credentials.key.clone()),
            ("CB-ACCESS-SIGN".to_string(), signature),
            ("CB-ACCESS-TIMESTAMP".to_string(), timestamp),
            (
                "CB-ACCESS-PASSPHRASE".to_string(),
                self.credentials.passphrase.clone(),
            ),
        ])
    }

    async fn get_json(&self, path_with_query: &str) -> Result<Value> {
        let mut last_err = None;
        for attempt in 1..=RETRIES {
            let client = self.fresh_client();
            match self.try_get(&client, path_with_query).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        path = path_with_query,
                        attempt,
                        error = %e,
                        "rest_call_failed"
                    );
                    self.replace_client();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rest call failed")))
            .with_context(|| format!("GET {path_with_query} failed after {RETRIES} attempts"))
    }

    async fn try_get(&self, client: &reqwest::Client, path_with_query: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path_with_query);
        let mut request = client.get(&url);
        for (name, value) in self.auth_headers("GET", path_with_query)? {
            request = request.header(name, value);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ExchangeApi for FeedRestClient {
    async fn order_book(&self, product_id: &str) -> Result<Value> {
        let book = self
            .get_json(&format!("/products/{product_id}/book?level=3"))
            .await?;
        info!(product_id, "order book snapshot received");
        Ok(book)
    }

    async fn trades(&self, product_id: &str) -> Result<Vec<Value>> {
        let trades = self
            .get_json(&format!("/products/{product_id}/trades?limit=100"))
            .await?;
        info!(product_id, "trades received");
        match trades {
            Value::Array(list) => Ok(list),
            other => anyhow::bail!("unexpected trades payload: {other}"),
        }
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}
