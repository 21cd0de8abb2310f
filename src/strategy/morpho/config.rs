use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Typed view of the executor config's opaque `strategyConfig` map. Decoded
/// once at worker startup; malformed config is fatal there.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MorphoConfig {
    #[serde(default)]
    pub fee_receiver: String,
    /// Vault index GraphQL endpoint.
    #[serde(rename = "baseURL", default)]
    pub base_url: String,
    #[serde(default)]
    pub base_fees_in_usd: f64,
    /// Fraction of positive realized yield charged on rebalance.
    #[serde(default)]
    pub yield_fees: f64,
    #[serde(default)]
    pub bundler_address: String,
    /// Per-token exact fee overrides, keyed by hex token address, value in
    /// base-token minor units.
    #[serde(default)]
    pub fee_config: HashMap<String, String>,
    /// Empty list means unrestricted.
    #[serde(default)]
    pub whitelisted_vaults: Vec<String>,
}

impl MorphoConfig {
    pub fn parse(raw: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(raw.clone())?)
    }

    pub fn fee_receiver_address(&self) -> anyhow::Result<Address> {
        Address::from_str(self.fee_receiver.trim())
            .map_err(|err| anyhow::anyhow!("invalid feeReceiver `{}`: {err}", self.fee_receiver))
    }

    pub fn bundler(&self) -> anyhow::Result<Address> {
        Address::from_str(self.bundler_address.trim()).map_err(|err| {
            anyhow::anyhow!("invalid bundlerAddress `{}`: {err}", self.bundler_address)
        })
    }

    /// Exact fee override for a token, if configured. Keys are compared as
    /// addresses so casing in the config does not matter.
    pub fn exact_fee_for(&self, token: Address) -> Option<&str> {
        self.fee_config.iter().find_map(|(key, fee)| {
            Address::from_str(key.trim())
                .ok()
                .filter(|parsed| *parsed == token)
                .map(|_| fee.as_str())
        })
    }

    pub fn is_whitelisted(&self, vault: Address) -> bool {
        if self.whitelisted_vaults.is_empty() {
            return true;
        }
        self.whitelisted_vaults
            .iter()
            .any(|entry| Address::from_str(entry.trim()).ok() == Some(vault))
    }
}

/// Strategy parameters carried in the subscription metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StrategyParams {
    #[serde(rename = "baseToken")]
    pub base_token: Address,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use serde_json::json;

    const USDC: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

    #[test]
    fn test_parse_strategy_config() {
        let raw = json!({
            "feeReceiver": "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5",
            "baseURL": "https://api.example.xyz/graphql",
            "baseFeesInUSD": 1.0,
            "yieldFees": 0.1,
            "bundlerAddress": "0x23055618898e202386e6c13955a58D3C68200BFB",
            "feeConfig": { "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913": "1000000" },
            "whitelistedVaults": []
        });
        let config = MorphoConfig::parse(&raw).expect("parse");
        assert_eq!(config.base_fees_in_usd, 1.0);
        assert_eq!(config.yield_fees, 0.1);
        assert!(config.fee_receiver_address().is_ok());
        assert!(config.bundler().is_ok());
        assert_eq!(config.exact_fee_for(USDC), Some("1000000"));
    }

    #[test]
    fn test_exact_fee_lookup_ignores_case() {
        let raw = json!({
            "feeConfig": { "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913": "1000000" }
        });
        let config = MorphoConfig::parse(&raw).expect("parse");
        assert_eq!(config.exact_fee_for(USDC), Some("1000000"));
        assert_eq!(
            config.exact_fee_for(address!("0000000000000000000000000000000000000001")),
            None
        );
    }

    #[test]
    fn test_empty_whitelist_is_unrestricted() {
        let config = MorphoConfig::default();
        assert!(config.is_whitelisted(USDC));
    }

    #[test]
    fn test_whitelist_restricts_when_non_empty() {
        let config = MorphoConfig {
            whitelisted_vaults: vec!["0xA238Dd80C259a72e81d7e4664a9801593F98d1c5".into()],
            ..Default::default()
        };
        assert!(config.is_whitelisted(address!("A238Dd80C259a72e81d7e4664a9801593F98d1c5")));
        assert!(!config.is_whitelisted(USDC));
    }

    #[test]
    fn test_strategy_params_decode() {
        let params: StrategyParams = serde_json::from_value(json!({
            "baseToken": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
        }))
        .expect("decode");
        assert_eq!(params.base_token, USDC);

        let malformed: Result<StrategyParams, _> =
            serde_json::from_value(json!({ "baseToken": 12 }));
        assert!(malformed.is_err());
    }
}
