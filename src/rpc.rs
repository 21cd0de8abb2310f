//! Multi-upstream RPC coordinator.
//!
//! One callable surface per chain that hides provider failure: every call
//! tries the primary upstream first, then the fallbacks in a freshly
//! permuted order. Random order keeps concurrent activities from herding
//! onto a single degraded fallback.

use crate::error::RpcError;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{
    Block, BlockTransactionsKind, Filter, Header, Log, Transaction, TransactionReceipt,
    TransactionRequest,
};
use alloy::transports::http::Http;
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

pub type HttpProvider = RootProvider<Http<Client>>;

/// Config shape: chain id (decimal string) to its RPC URLs, primary first.
pub type ChainRpcUrls = BTreeMap<String, Vec<String>>;

#[derive(Debug, Serialize)]
pub struct RawJsonRpcRequest {
    pub id: u64,
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Vec<Value>,
}

impl RawJsonRpcRequest {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Self {
            id: 1,
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawJsonRpcResponse {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

struct Upstream {
    provider: Arc<HttpProvider>,
    host: String,
}

/// Read-side failover client for one chain.
pub struct FailoverClient {
    primary: Upstream,
    fallbacks: Vec<Upstream>,
    raw_urls: Vec<String>,
    http: Client,
    chain_id: u64,
}

/// Fresh permutation of fallback indices, one per call.
fn permuted_fallback_indices(len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rand::thread_rng());
    order
}

impl FailoverClient {
    fn new(chain_id: u64, urls: &[String]) -> Result<Self, RpcError> {
        let mut upstreams = Vec::with_capacity(urls.len());
        let mut raw_urls = Vec::with_capacity(urls.len());
        for url in urls {
            let parsed = url
                .parse::<reqwest::Url>()
                .map_err(|err| RpcError::InvalidUrl {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
            let host = parsed.host_str().unwrap_or(url).to_string();
            raw_urls.push(url.clone());
            upstreams.push(Upstream {
                provider: Arc::new(ProviderBuilder::new().on_http(parsed)),
                host,
            });
        }

        let mut iter = upstreams.into_iter();
        let primary = iter.next().ok_or(RpcError::InvalidChainId)?;
        Ok(Self {
            primary,
            fallbacks: iter.collect(),
            raw_urls,
            http: Client::new(),
            chain_id,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn first_successful<T, F, Fut>(&self, op: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<HttpProvider>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match op(self.primary.provider.clone()).await {
            Ok(value) => return Ok(value),
            Err(_) => {
                tracing::warn!(
                    provider = %self.primary.host,
                    chain_id = self.chain_id,
                    "failed to call primary upstream rpc"
                );
            }
        }

        for idx in permuted_fallback_indices(self.fallbacks.len()) {
            let fallback = &self.fallbacks[idx];
            match op(fallback.provider.clone()).await {
                Ok(value) => return Ok(value),
                Err(_) => {
                    tracing::warn!(
                        provider = %fallback.host,
                        chain_id = self.chain_id,
                        "failed to call fallback upstream rpc"
                    );
                }
            }
        }

        tracing::error!(chain_id = self.chain_id, "failed to call all upstream rpc");
        Err(RpcError::FailedToCallAllUpstreams)
    }

    pub async fn call_contract(&self, tx: &TransactionRequest) -> Result<Bytes, RpcError> {
        self.first_successful(|p| {
            let tx = tx.clone();
            async move { p.call(&tx).await.map_err(anyhow::Error::from) }
        })
        .await
    }

    pub async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.first_successful(|p| async move {
            p.get_transaction_receipt(tx_hash)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn transaction_by_hash(
        &self,
        tx_hash: B256,
    ) -> Result<Option<Transaction>, RpcError> {
        self.first_successful(|p| async move {
            p.get_transaction_by_hash(tx_hash)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn remote_chain_id(&self) -> Result<u64, RpcError> {
        self.first_successful(|p| async move { p.get_chain_id().await.map_err(anyhow::Error::from) })
            .await
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.first_successful(
            |p| async move { p.get_block_number().await.map_err(anyhow::Error::from) },
        )
        .await
    }

    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, RpcError> {
        self.first_successful(|p| {
            let tx = tx.clone();
            async move {
                p.estimate_gas(&tx)
                    .await
                    .map(|gas| gas as u64)
                    .map_err(anyhow::Error::from)
            }
        })
        .await
    }

    pub async fn suggest_gas_price(&self) -> Result<u128, RpcError> {
        self.first_successful(|p| async move { p.get_gas_price().await.map_err(anyhow::Error::from) })
            .await
    }

    pub async fn suggest_gas_tip_cap(&self) -> Result<u128, RpcError> {
        self.first_successful(|p| async move {
            p.get_max_priority_fee_per_gas()
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn filter_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.first_successful(|p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await.map_err(anyhow::Error::from) }
        })
        .await
    }

    pub async fn balance_at(&self, account: Address) -> Result<U256, RpcError> {
        self.first_successful(|p| async move {
            p.get_balance(account).await.map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn storage_at(&self, account: Address, key: U256) -> Result<U256, RpcError> {
        self.first_successful(|p| async move {
            p.get_storage_at(account, key)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn code_at(&self, account: Address) -> Result<Bytes, RpcError> {
        self.first_successful(|p| async move {
            p.get_code_at(account).await.map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn nonce_at(&self, account: Address) -> Result<u64, RpcError> {
        self.first_successful(|p| async move {
            p.get_transaction_count(account)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn block_by_hash(&self, hash: B256) -> Result<Option<Block>, RpcError> {
        self.first_successful(|p| async move {
            p.get_block_by_hash(hash, BlockTransactionsKind::Full)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.first_successful(|p| async move {
            p.get_block_by_number(number.into(), BlockTransactionsKind::Full)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, RpcError> {
        self.first_successful(|p| async move {
            p.get_block_by_hash(hash, BlockTransactionsKind::Hashes)
                .await
                .map(|block| block.map(|b| b.header))
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn header_by_number(&self, number: u64) -> Result<Option<Header>, RpcError> {
        self.first_successful(|p| async move {
            p.get_block_by_number(number.into(), BlockTransactionsKind::Hashes)
                .await
                .map(|block| block.map(|b| b.header))
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn transaction_count(&self, block_hash: B256) -> Result<u64, RpcError> {
        self.first_successful(|p| async move {
            let raw: String = p
                .raw_request(
                    std::borrow::Cow::Borrowed("eth_getBlockTransactionCountByHash"),
                    serde_json::json!([block_hash]),
                )
                .await
                .map_err(anyhow::Error::from)?;
            u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn transaction_in_block(
        &self,
        block_hash: B256,
        index: u64,
    ) -> Result<Option<Transaction>, RpcError> {
        self.first_successful(|p| async move {
            p.raw_request(
                std::borrow::Cow::Borrowed("eth_getTransactionByBlockHashAndIndex"),
                serde_json::json!([block_hash, format!("0x{index:x}")]),
            )
            .await
            .map_err(anyhow::Error::from)
        })
        .await
    }

    /// Raw JSON-RPC passthrough. Tries every configured URL in order; HTTP
    /// 400 fails as a bad request, any other non-200 as a generic failure.
    pub async fn raw_request(
        &self,
        body: &RawJsonRpcRequest,
    ) -> Result<RawJsonRpcResponse, RpcError> {
        for url in &self.raw_urls {
            match self.call_raw(url, body).await {
                Ok(resp) => return Ok(resp),
                Err(_) => continue,
            }
        }
        Err(RpcError::FailedToCallAllUpstreams)
    }

    async fn call_raw(
        &self,
        url: &str,
        body: &RawJsonRpcRequest,
    ) -> Result<RawJsonRpcResponse, RpcError> {
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|_| RpcError::CallFailed)?;

        match resp.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::BAD_REQUEST => return Err(RpcError::BadRequest),
            _ => return Err(RpcError::CallFailed),
        }

        let out: RawJsonRpcResponse = resp.json().await.map_err(|_| RpcError::CallFailed)?;
        if let Some(error) = &out.error {
            tracing::warn!(%error, "invalid response from upstream");
            return Err(RpcError::InvalidUpstreamResponse);
        }
        Ok(out)
    }
}

/// Per-chain failover clients built from the configured URL map.
pub struct Rpc {
    clients: HashMap<u64, Arc<FailoverClient>>,
}

impl Rpc {
    pub fn new(cfg: &ChainRpcUrls) -> Result<Self, RpcError> {
        let mut clients = HashMap::new();
        for (chain, urls) in cfg {
            if urls.is_empty() {
                return Err(RpcError::InvalidChainId);
            }
            let chain_id: u64 = chain
                .trim()
                .parse()
                .map_err(|_| RpcError::InvalidChainId)?;
            clients.insert(chain_id, Arc::new(FailoverClient::new(chain_id, urls)?));
        }
        Ok(Self { clients })
    }

    pub fn client(&self, chain_id: u64) -> Result<Arc<FailoverClient>, RpcError> {
        self.clients
            .get(&chain_id)
            .cloned()
            .ok_or(RpcError::InvalidChainId)
    }
}
