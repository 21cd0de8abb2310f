//! USD → token pricing used for fee conversion when no per-token override is
//! configured.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const PRICES_API_URL: &str = "https://coins.llama.fi/prices/current";

#[async_trait]
pub trait PricingOracle: Send + Sync {
    /// Convert a USD amount into minor units of `token` on `chain_id`.
    async fn convert_usd_to_token(
        &self,
        chain_id: u64,
        amount_usd: f64,
        token: Address,
    ) -> anyhow::Result<U256>;
}

fn chain_slug(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("ethereum"),
        10 => Some("optimism"),
        56 => Some("bsc"),
        137 => Some("polygon"),
        8453 => Some("base"),
        42161 => Some("arbitrum"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct PricesResponse {
    #[serde(default)]
    coins: HashMap<String, CoinPrice>,
}

#[derive(Debug, Deserialize)]
struct CoinPrice {
    price: f64,
    #[serde(default)]
    decimals: Option<u32>,
}

/// Computes `floor(amount_usd / price × 10^decimals)`.
fn usd_to_minor_units(amount_usd: f64, price: f64, decimals: u32) -> Option<U256> {
    if !(price.is_finite() && price > 0.0 && amount_usd.is_finite() && amount_usd >= 0.0) {
        return None;
    }
    let tokens = amount_usd / price;
    let scaled = tokens * 10f64.powi(decimals as i32);
    if !scaled.is_finite() || scaled < 0.0 {
        return None;
    }
    Some(U256::from(scaled.floor() as u128))
}

#[derive(Debug, Clone)]
pub struct PriceApiOracle {
    base_url: String,
    client: reqwest::Client,
}

impl PriceApiOracle {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(PRICES_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PricingOracle for PriceApiOracle {
    async fn convert_usd_to_token(
        &self,
        chain_id: u64,
        amount_usd: f64,
        token: Address,
    ) -> anyhow::Result<U256> {
        let slug = chain_slug(chain_id)
            .ok_or_else(|| anyhow::anyhow!("no price feed slug for chain {chain_id}"))?;
        let coin_key = format!("{slug}:{token:#x}");
        let url = format!("{}/{}", self.base_url, coin_key);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("price feed returned HTTP {status}");
        }
        let body: PricesResponse = resp.json().await?;

        let coin = body
            .coins
            .get(&coin_key)
            .or_else(|| body.coins.values().next())
            .ok_or_else(|| anyhow::anyhow!("no price for {coin_key}"))?;
        let decimals = coin
            .decimals
            .ok_or_else(|| anyhow::anyhow!("no decimals for {coin_key}"))?;

        usd_to_minor_units(amount_usd, coin.price, decimals)
            .ok_or_else(|| anyhow::anyhow!("unusable price {} for {coin_key}", coin.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usd_to_minor_units_stablecoin() {
        // 1 USD of a 6-decimal token priced at exactly 1 USD
        assert_eq!(
            usd_to_minor_units(1.0, 1.0, 6),
            Some(U256::from(1_000_000u64))
        );
    }

    #[test]
    fn test_usd_to_minor_units_floors() {
        // 1 USD at price 3.0 → 0.333... tokens → floored minor units
        assert_eq!(usd_to_minor_units(1.0, 3.0, 6), Some(U256::from(333_333u64)));
    }

    #[test]
    fn test_usd_to_minor_units_rejects_bad_price() {
        assert_eq!(usd_to_minor_units(1.0, 0.0, 6), None);
        assert_eq!(usd_to_minor_units(1.0, -1.0, 6), None);
        assert_eq!(usd_to_minor_units(1.0, f64::NAN, 6), None);
        assert_eq!(usd_to_minor_units(-1.0, 1.0, 6), None);
    }

    #[test]
    fn test_prices_response_decodes() {
        let raw = r#"{
          "coins": {
            "base:0x833589fcd6edb6e08f4c7c32d4f71b54bda02913": {
              "decimals": 6,
              "symbol": "USDC",
              "price": 0.9998,
              "timestamp": 1738000000
            }
          }
        }"#;
        let parsed: PricesResponse = serde_json::from_str(raw).expect("parse");
        let coin = parsed.coins.values().next().expect("coin");
        assert_eq!(coin.decimals, Some(6));
        assert!((coin.price - 0.9998).abs() < 1e-9);
    }

    #[test]
    fn test_chain_slugs_cover_supported_chains() {
        assert_eq!(chain_slug(1), Some("ethereum"));
        assert_eq!(chain_slug(8453), Some("base"));
        assert_eq!(chain_slug(424242), None);
    }
}
