//! Executor / signer boundary.
//!
//! Turns a logical `(subAccount, to, value, data, operation, chainId)`
//! intent into a remotely-signed task on the console: read the executor
//! plugin nonce, compute the executable typed-data digest, wrap it as a
//! Safe message digest, sign through the key manager, submit.

use crate::abi::IExecutorPlugin;
use crate::console::{ConsoleClient, Executable, ExecuteTaskReq, ExecutorMetadata, Task};
use crate::error::SigningError;
use crate::rpc::FailoverClient;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Remote key manager. The signing address's key never leaves it.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, digest: B256, signer: Address) -> Result<Vec<u8>, SigningError>;
}

/// Submits a prepared intent for signing and execution.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Returns the remote task id on success.
    async fn execute(&self, req: &SignAndExecuteRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignAndExecuteRequest {
    pub subaccount: String,
    #[serde(rename = "chainID")]
    pub chain_id: u64,
    pub operation: u8,
    pub to: String,
    pub value: String,
    pub data: String,
}

const EXECUTION_PARAMS_TYPEHASH: &str = "ExecutionParams(address to,uint256 value,bytes data,uint8 operation,address account,address executor,uint256 nonce)";
const EXECUTOR_PLUGIN_DOMAIN_TYPEHASH: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const SAFE_MESSAGE_TYPEHASH: &str = "SafeMessage(bytes message)";
const SAFE_DOMAIN_TYPEHASH: &str = "EIP712Domain(uint256 chainId,address verifyingContract)";
const EXECUTOR_PLUGIN_DOMAIN_NAME: &str = "ExecutorPlugin";
const EXECUTOR_PLUGIN_DOMAIN_VERSION: &str = "1.0";

fn word_from_address(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

fn word_from_u8(value: u8) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[31] = value;
    word
}

fn hash_words(words: &[[u8; 32]]) -> B256 {
    let mut encoded = Vec::with_capacity(words.len() * 32);
    for word in words {
        encoded.extend_from_slice(word);
    }
    keccak256(encoded)
}

/// EIP-712 digest the executor plugin verifies before accepting a call on
/// behalf of a sub-account.
#[allow(clippy::too_many_arguments)]
pub fn executable_digest(
    chain_id: u64,
    plugin_address: Address,
    to: Address,
    value: U256,
    data: &[u8],
    operation: u8,
    sub_account: Address,
    nonce: U256,
    executor: Address,
) -> B256 {
    let struct_hash = hash_words(&[
        keccak256(EXECUTION_PARAMS_TYPEHASH.as_bytes()).0,
        word_from_address(to),
        value.to_be_bytes::<32>(),
        keccak256(data).0,
        word_from_u8(operation),
        word_from_address(sub_account),
        word_from_address(executor),
        nonce.to_be_bytes::<32>(),
    ]);

    let domain_separator = hash_words(&[
        keccak256(EXECUTOR_PLUGIN_DOMAIN_TYPEHASH.as_bytes()).0,
        keccak256(EXECUTOR_PLUGIN_DOMAIN_NAME.as_bytes()).0,
        keccak256(EXECUTOR_PLUGIN_DOMAIN_VERSION.as_bytes()).0,
        U256::from(chain_id).to_be_bytes::<32>(),
        word_from_address(plugin_address),
    ]);

    typed_data_digest(domain_separator, struct_hash)
}

/// Wrap an inner digest as the Safe message the executor's owner key signs,
/// bound to `(chainId, executorAddress)`.
pub fn safe_message_digest(message: B256, chain_id: u64, executor: Address) -> B256 {
    let struct_hash = hash_words(&[
        keccak256(SAFE_MESSAGE_TYPEHASH.as_bytes()).0,
        keccak256(message.as_slice()).0,
    ]);
    let domain_separator = hash_words(&[
        keccak256(SAFE_DOMAIN_TYPEHASH.as_bytes()).0,
        U256::from(chain_id).to_be_bytes::<32>(),
        word_from_address(executor),
    ]);
    typed_data_digest(domain_separator, struct_hash)
}

fn typed_data_digest(domain_separator: B256, struct_hash: B256) -> B256 {
    let mut preimage = Vec::with_capacity(66);
    preimage.extend_from_slice(&[0x19, 0x01]);
    preimage.extend_from_slice(domain_separator.as_slice());
    preimage.extend_from_slice(struct_hash.as_slice());
    keccak256(preimage)
}

/// Shift a 0/1 recovery byte into the 27/28 form verifiers expect. The 64
/// signature bytes are untouched; a V already ≥ 27 passes through.
pub fn normalize_signature(mut signature: Vec<u8>) -> Result<Vec<u8>, SigningError> {
    if signature.len() != 65 {
        return Err(SigningError::ShortSignature(signature.len()));
    }
    if signature[64] == 0 || signature[64] == 1 {
        signature[64] += 27;
    }
    Ok(signature)
}

fn signing_address(executor: Address, configured_signer: Address) -> Address {
    if configured_signer != Address::ZERO {
        configured_signer
    } else {
        executor
    }
}

pub struct ConsoleExecutor {
    executor_address: Address,
    signer_address: Address,
    plugin_address: Address,
    rpc: Arc<FailoverClient>,
    signer: Arc<dyn Signer>,
    console: ConsoleClient,
    metadata: ExecutorMetadata,
}

impl ConsoleExecutor {
    pub async fn new(
        executor_address: Address,
        chain_id: u64,
        rpc: Arc<FailoverClient>,
        signer: Arc<dyn Signer>,
        console: ConsoleClient,
        signer_address: Address,
        plugin_address: Address,
    ) -> anyhow::Result<Self> {
        let metadata = console
            .executor_by_address_and_chain_id(executor_address, chain_id)
            .await?;

        Ok(Self {
            executor_address,
            signer_address,
            plugin_address,
            rpc,
            signer,
            console,
            metadata,
        })
    }

    pub fn registry_id(&self) -> &str {
        &self.metadata.id
    }

    async fn executor_nonce(&self, sub_account: Address) -> anyhow::Result<U256> {
        let calldata = IExecutorPlugin::executorNonceCall {
            account: sub_account,
            executor: self.executor_address,
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .to(self.plugin_address)
            .input(TransactionInput::new(Bytes::from(calldata)));
        let raw = self.rpc.call_contract(&tx).await?;
        let decoded =
            <IExecutorPlugin::executorNonceCall as SolCall>::abi_decode_returns(raw.as_ref(), true)?;
        Ok(decoded._0)
    }
}

#[async_trait]
impl TaskSubmitter for ConsoleExecutor {
    async fn execute(&self, req: &SignAndExecuteRequest) -> anyhow::Result<String> {
        let sub_account = Address::from_str(&req.subaccount)?;
        let to = Address::from_str(&req.to)?;
        let value = U256::from_str(&req.value)
            .map_err(|err| anyhow::anyhow!("invalid task value `{}`: {err}", req.value))?;
        let calldata = hex::decode(req.data.trim_start_matches("0x"))?;

        let nonce = self.executor_nonce(sub_account).await?;
        let digest = executable_digest(
            req.chain_id,
            self.plugin_address,
            to,
            value,
            &calldata,
            req.operation,
            sub_account,
            nonce,
            self.executor_address,
        );
        let safe_digest = safe_message_digest(digest, req.chain_id, self.executor_address);

        let signer = signing_address(self.executor_address, self.signer_address);
        let signature = self.signer.sign(safe_digest, signer).await?;
        let signature = normalize_signature(signature)?;

        let resp = self
            .console
            .execute(&ExecuteTaskReq {
                chain_id: req.chain_id,
                task: Task {
                    subaccount: req.subaccount.clone(),
                    executor: self.executor_address.to_checksum(None),
                    executor_signature: format!("0x{}", hex::encode(signature)),
                    executable: Executable {
                        call_type: req.operation,
                        to: req.to.clone(),
                        value: req.value.clone(),
                        data: req.data.clone(),
                    },
                },
                webhook: String::new(),
            })
            .await?;

        let task_id = resp.into_task_id()?;
        tracing::info!(task_id = %task_id, subaccount = %req.subaccount, "executor task accepted");
        Ok(task_id)
    }
}
