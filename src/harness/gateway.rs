//! HTTP client for the external CLMM exchange gateway.
//!
//! Every call returns a uniform envelope `{success, data, error,
//! latency_ms}`; transport failures are folded into the envelope rather
//! than raised, so callers decide how a dead gateway maps onto episode
//! status.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const CLMM_ROOT: &str = "/connectors/uniswap/clmm";

/// Uniform gateway response envelope.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub latency_ms: f64,
}

impl GatewayResponse {
    fn failure(error: String, latency_ms: f64) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error),
            latency_ms,
        }
    }
}

pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn request(&self, method: &str, path: &str, payload: Option<Value>) -> GatewayResponse {
        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();

        let builder = match method {
            "GET" => self.client.get(&url),
            _ => {
                let b = self.client.post(&url);
                match payload {
                    Some(p) => b.json(&p),
                    None => b,
                }
            }
        };

        match builder.send().await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                if !response.status().is_success() {
                    return GatewayResponse::failure(
                        format!("HTTP {}", response.status()),
                        latency_ms,
                    );
                }
                match response.json::<Value>().await {
                    Ok(data) => GatewayResponse {
                        success: true,
                        data,
                        error: None,
                        latency_ms,
                    },
                    Err(e) => GatewayResponse::failure(e.to_string(), latency_ms),
                }
            }
            Err(e) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                GatewayResponse::failure(e.to_string(), latency_ms)
            }
        }
    }

    /// Liveness probe with bounded latency.
    pub async fn health_check(&self) -> GatewayResponse {
        self.request("GET", "/", None).await
    }

    pub async fn pool_info(
        &self,
        chain: &str,
        network: &str,
        pool_address: &str,
    ) -> GatewayResponse {
        let payload = json!({
            "chain": chain,
            "network": network,
            "connector": "uniswap",
            "address": pool_address,
        });
        self.request("POST", &format!("{CLMM_ROOT}/poolInfo"), Some(payload))
            .await
    }

    /// Quote a position (simulate opening). Used as the safety gate in
    /// the quote-then-execute pattern.
    #[allow(clippy::too_many_arguments)]
    pub async fn quote_position(
        &self,
        chain: &str,
        network: &str,
        token0: &str,
        token1: &str,
        fee: &str,
        lower_price: f64,
        upper_price: f64,
        amount: f64,
    ) -> GatewayResponse {
        let payload = json!({
            "chain": chain,
            "network": network,
            "connector": "uniswap",
            "token0": token0,
            "token1": token1,
            "fee": fee,
            "lowerPrice": format!("{lower_price}"),
            "upperPrice": format!("{upper_price}"),
            "amount0": format!("{amount}"),
        });
        self.request("POST", &format!("{CLMM_ROOT}/quotePosition"), Some(payload))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        chain: &str,
        network: &str,
        address: &str,
        token0: &str,
        token1: &str,
        fee: &str,
        lower_price: f64,
        upper_price: f64,
        amount: f64,
    ) -> GatewayResponse {
        let payload = json!({
            "chain": chain,
            "network": network,
            "connector": "uniswap",
            "address": address,
            "token0": token0,
            "token1": token1,
            "fee": fee,
            "lowerPrice": format!("{lower_price}"),
            "upperPrice": format!("{upper_price}"),
            "amount0": format!("{amount}"),
        });
        self.request("POST", &format!("{CLMM_ROOT}/openPosition"), Some(payload))
            .await
    }

    pub async fn close_position(
        &self,
        chain: &str,
        network: &str,
        address: &str,
        token_id: u64,
    ) -> GatewayResponse {
        let payload = json!({
            "chain": chain,
            "network": network,
            "connector": "uniswap",
            "address": address,
            "tokenId": token_id,
        });
        self.request("POST", &format!("{CLMM_ROOT}/closePosition"), Some(payload))
            .await
    }
}
