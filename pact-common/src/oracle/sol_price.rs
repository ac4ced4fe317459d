use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;

use crate::error::AppError;
use crate::oracle::PriceOracle;

// Short enough that a live market-cap decision never sees a stale price.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct SolPriceResponse {
    #[serde(rename = "solPrice")]
    sol_price: f64,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price_usd: f64,
    fetched_at: Instant,
}

pub struct SolPriceClient {
    client: Client,
    url: String,
    ttl: Duration,
    cached: RwLock<Option<CachedPrice>>,
}

impl SolPriceClient {
    pub fn new(url: &str, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            url: url.to_string(),
            ttl: PRICE_CACHE_TTL,
            cached: RwLock::new(None),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl PriceOracle for SolPriceClient {
    async fn sol_price_usd(&self) -> Result<f64, AppError> {
        if let Some(cached) = *self.cached.read() {
            if cached.fetched_at.elapsed() <= self.ttl {
                return Ok(cached.price_usd);
            }
        }

        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AppError::RequestError(format!("SOL price request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::PriceNotAvailable(format!(
                "price endpoint returned {}",
                status
            )));
        }

        let body: SolPriceResponse = resp
            .json()
            .await
            .map_err(|e| AppError::PriceNotAvailable(format!("bad price payload: {}", e)))?;

        if !body.sol_price.is_finite() || body.sol_price <= 0.0 {
            return Err(AppError::InvalidPrice(format!(
                "price endpoint returned {}",
                body.sol_price
            )));
        }

        *self.cached.write() = Some(CachedPrice {
            price_usd: body.sol_price,
            fetched_at: Instant::now(),
        });

        Ok(body.sol_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_payload_decodes() {
        let body: SolPriceResponse = serde_json::from_str(r#"{ "solPrice": 142.35 }"#).unwrap();
        assert_eq!(body.sol_price, 142.35);
    }

    #[test]
    fn price_payload_without_field_is_rejected() {
        assert!(serde_json::from_str::<SolPriceResponse>(r#"{ "price": 1.0 }"#).is_err());
    }
}
