//! Vault index (GraphQL) and on-chain vault reads.
//!
//! The index answers "which whitelisted vaults exist for this asset and
//! chain, best net APY first"; the chain reader answers "what does this
//! sub-account actually hold". The strategy activity composes both.

use crate::abi::{IERC20, IERC4626Vault};
use crate::rpc::FailoverClient;
use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const VAULT_PAGE_SIZE: u32 = 15;
const ORDER_BY_NET_APY: &str = "NetApy";
const ORDER_DIRECTION_DESC: &str = "Desc";

/// Accepts the index's big-integer rendering as either a JSON string or a
/// bare number.
fn u256_from_string_or_number<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(raw) => {
            U256::from_str(raw.trim()).map_err(serde::de::Error::custom)
        }
        serde_json::Value::Number(num) => {
            U256::from_str(&num.to_string()).map_err(serde::de::Error::custom)
        }
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct VaultInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub asset: VaultAsset,
    #[serde(default)]
    pub state: VaultState,
    #[serde(default)]
    pub liquidity: VaultLiquidity,
}

impl VaultInfo {
    pub fn vault_address(&self) -> Option<Address> {
        Address::from_str(self.address.trim()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct VaultAsset {
    #[serde(default)]
    pub chain: VaultChain,
    #[serde(default)]
    pub decimals: u32,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct VaultChain {
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VaultState {
    #[serde(default)]
    pub apy: f64,
    #[serde(default)]
    pub net_apy: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VaultLiquidity {
    #[serde(deserialize_with = "u256_from_string_or_number", default)]
    pub underlying: U256,
}

impl Default for VaultLiquidity {
    fn default() -> Self {
        Self {
            underlying: U256::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub vault_positions: Vec<VaultPosition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VaultPosition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub assets_usd: f64,
    #[serde(default)]
    pub vault: VaultBasicInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct VaultBasicInfo {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub symbol: String,
}

#[async_trait]
pub trait VaultIndex: Send + Sync {
    /// Whitelisted candidate vaults for `(asset, chain)`, net APY
    /// descending, capped at the index page size.
    async fn vaults(&self, asset: Address, chain_id: u64) -> anyhow::Result<Vec<VaultInfo>>;

    async fn user(&self, address: Address) -> anyhow::Result<Vec<UserInfo>>;
}

#[async_trait]
pub trait VaultChainReader: Send + Sync {
    /// ERC-20 balance of `owner` in `token` minor units.
    async fn token_balance(&self, token: Address, owner: Address) -> anyhow::Result<U256>;

    async fn shares(&self, vault: Address, depositor: Address) -> anyhow::Result<U256>;

    /// Underlying value of the depositor's full share balance.
    async fn preview_redeem(&self, vault: Address, depositor: Address) -> anyhow::Result<U256>;

    async fn preview_deposit(&self, vault: Address, assets: U256) -> anyhow::Result<U256>;

    /// Calldata for `redeem(allShares, depositor, depositor)` against the
    /// vault's own ABI.
    async fn redeem_max_calldata(
        &self,
        vault: Address,
        depositor: Address,
    ) -> anyhow::Result<Vec<u8>>;
}

const VAULTS_QUERY: &str = r#"query Vaults($asset: [String!], $chainID: [Int!], $orderBy: VaultOrderBy, $orderDirection: OrderDirection, $first: Int) {
  vaults(where: { assetAddress_in: $asset, chainId_in: $chainID, whitelisted: true }, orderBy: $orderBy, orderDirection: $orderDirection, first: $first) {
    items {
      id
      address
      symbol
      asset { chain { id } decimals address }
      state { apy netApy }
      liquidity { underlying }
    }
  }
}"#;

const USERS_QUERY: &str = r#"query Users($address: [String!]) {
  users(where: { address_in: $address }) {
    items {
      vaultPositions { id assetsUsd vault { address id symbol } }
    }
  }
}"#;

#[derive(Debug, Deserialize, Default)]
struct ItemsPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize, Default)]
struct VaultsData {
    #[serde(default)]
    vaults: ItemsPage<VaultInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct UsersData {
    #[serde(default)]
    users: ItemsPage<UserInfo>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

/// GraphQL client over the vault index endpoint.
#[derive(Debug, Clone)]
pub struct VaultIndexClient {
    endpoint: String,
    client: reqwest::Client,
}

impl VaultIndexClient {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    async fn query<T: serde::de::DeserializeOwned + Default>(
        &self,
        query: &'static str,
        variables: serde_json::Value,
    ) -> anyhow::Result<T> {
        let resp: GraphQlResponse<T> = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .json()
            .await?;

        if let Some(errors) = resp.errors {
            anyhow::bail!("vault index query failed: {errors}");
        }
        Ok(resp.data.unwrap_or_default())
    }
}

#[async_trait]
impl VaultIndex for VaultIndexClient {
    async fn vaults(&self, asset: Address, chain_id: u64) -> anyhow::Result<Vec<VaultInfo>> {
        let data: VaultsData = self
            .query(
                VAULTS_QUERY,
                json!({
                    "asset": [asset.to_checksum(None)],
                    "chainID": [chain_id],
                    "orderBy": ORDER_BY_NET_APY,
                    "orderDirection": ORDER_DIRECTION_DESC,
                    "first": VAULT_PAGE_SIZE,
                }),
            )
            .await?;
        Ok(data.vaults.items)
    }

    async fn user(&self, address: Address) -> anyhow::Result<Vec<UserInfo>> {
        let data: UsersData = self
            .query(
                USERS_QUERY,
                json!({ "address": [address.to_checksum(None)] }),
            )
            .await?;
        Ok(data.users.items)
    }
}

/// On-chain ERC-4626 reads through the failover RPC client.
pub struct VaultReader {
    rpc: Arc<FailoverClient>,
}

impl VaultReader {
    pub fn new(rpc: Arc<FailoverClient>) -> Self {
        Self { rpc }
    }

    async fn read(&self, vault: Address, calldata: Vec<u8>) -> anyhow::Result<Bytes> {
        let tx = TransactionRequest::default()
            .to(vault)
            .input(TransactionInput::new(Bytes::from(calldata)));
        Ok(self.rpc.call_contract(&tx).await?)
    }
}

#[async_trait]
impl VaultChainReader for VaultReader {
    async fn token_balance(&self, token: Address, owner: Address) -> anyhow::Result<U256> {
        let raw = self
            .read(token, IERC20::balanceOfCall { owner }.abi_encode())
            .await?;
        let decoded = <IERC20::balanceOfCall as SolCall>::abi_decode_returns(raw.as_ref(), true)?;
        Ok(decoded.balance)
    }

    async fn shares(&self, vault: Address, depositor: Address) -> anyhow::Result<U256> {
        let raw = self
            .read(
                vault,
                IERC4626Vault::balanceOfCall { owner: depositor }.abi_encode(),
            )
            .await?;
        let decoded =
            <IERC4626Vault::balanceOfCall as SolCall>::abi_decode_returns(raw.as_ref(), true)?;
        Ok(decoded.shares)
    }

    async fn preview_redeem(&self, vault: Address, depositor: Address) -> anyhow::Result<U256> {
        let shares = self.shares(vault, depositor).await?;
        let raw = self
            .read(vault, IERC4626Vault::previewRedeemCall { shares }.abi_encode())
            .await?;
        let decoded =
            <IERC4626Vault::previewRedeemCall as SolCall>::abi_decode_returns(raw.as_ref(), true)?;
        Ok(decoded.assets)
    }

    async fn preview_deposit(&self, vault: Address, assets: U256) -> anyhow::Result<U256> {
        let raw = self
            .read(vault, IERC4626Vault::previewDepositCall { assets }.abi_encode())
            .await?;
        let decoded =
            <IERC4626Vault::previewDepositCall as SolCall>::abi_decode_returns(raw.as_ref(), true)?;
        Ok(decoded.shares)
    }

    async fn redeem_max_calldata(
        &self,
        vault: Address,
        depositor: Address,
    ) -> anyhow::Result<Vec<u8>> {
        let shares = self.shares(vault, depositor).await?;
        Ok(IERC4626Vault::redeemCall {
            shares,
            receiver: depositor,
            owner: depositor,
        }
        .abi_encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vaults_response_decodes() {
        let raw = r#"{
          "data": {
            "vaults": {
              "items": [
                {
                  "id": "v8",
                  "address": "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5",
                  "symbol": "mwUSDC",
                  "asset": { "chain": { "id": 8453 }, "decimals": 6, "address": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913" },
                  "state": { "apy": 0.08, "netApy": 0.078 },
                  "liquidity": { "underlying": "2000000000" }
                },
                {
                  "id": "v5",
                  "address": "0xBA12222222228d8Ba445958a75a0704d566BF2C8",
                  "symbol": "mwUSDC2",
                  "asset": { "chain": { "id": 8453 }, "decimals": 6, "address": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913" },
                  "state": { "apy": 0.05, "netApy": 0.049 },
                  "liquidity": { "underlying": 1500000000 }
                }
              ]
            }
          }
        }"#;

        let parsed: GraphQlResponse<VaultsData> = serde_json::from_str(raw).expect("parse");
        let items = parsed.data.expect("data").vaults.items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].state.net_apy, 0.078);
        assert_eq!(items[0].liquidity.underlying, U256::from(2_000_000_000u64));
        // number form decodes too
        assert_eq!(items[1].liquidity.underlying, U256::from(1_500_000_000u64));
        assert!(items[0].vault_address().is_some());
    }

    #[test]
    fn test_users_response_decodes() {
        let raw = r#"{
          "data": {
            "users": {
              "items": [
                {
                  "vaultPositions": [
                    { "id": "p1", "assetsUsd": 1234.5, "vault": { "address": "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5", "id": "v8", "symbol": "mwUSDC" } }
                  ]
                }
              ]
            }
          }
        }"#;
        let parsed: GraphQlResponse<UsersData> = serde_json::from_str(raw).expect("parse");
        let users = parsed.data.expect("data").users.items;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].vault_positions.len(), 1);
        assert_eq!(users[0].vault_positions[0].vault.symbol, "mwUSDC");
    }

    #[test]
    fn test_graphql_errors_surface() {
        let raw = r#"{ "errors": [ { "message": "rate limited" } ] }"#;
        let parsed: GraphQlResponse<VaultsData> = serde_json::from_str(raw).expect("parse");
        assert!(parsed.errors.is_some());
    }

    #[test]
    fn test_liquidity_rejects_bool() {
        let raw = r#"{ "underlying": true }"#;
        let parsed: Result<VaultLiquidity, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }
}
