//! Configuration schema.
//!
//! Every field is populated by an explicit key lookup against the secret
//! store, validated, then passed around as a frozen value. Structured values
//! are JSON-encoded strings in the store.

use crate::engine::{ActivityOptions, RetryPolicy};
use crate::error::ConfigError;
use crate::rpc::ChainRpcUrls;
use crate::utils::parse_duration;
use alloy::primitives::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub const STRATEGY_ID_MORPHO_REBALANCER_BASE: &str = "morpho-rebalancer-base";
pub const STRATEGY_ID_MORPHO_REBALANCER_MAINNET: &str = "morpho-rebalancer-mainnet";

/// One key-value view over the secret store's config map.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<Value>;
}

impl ConfigSource for HashMap<String, Value> {
    fn get(&self, key: &str) -> Option<Value> {
        HashMap::get(self, key).cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub activity_timeout: String,
    pub task_queue: String,
    pub retry_attempts: u32,
    pub maximum_retry_interval: String,
    pub chain_id: u64,
    pub address: String,
    #[serde(default)]
    pub signer: String,
    /// Default cadence for schedules under this executor.
    pub every: String,
    #[serde(default)]
    pub strategy_config: Value,
    #[serde(rename = "Id", default)]
    pub id: String,
}

impl ExecutorConfig {
    pub fn executor_address(&self) -> Result<Address, ConfigError> {
        Address::from_str(self.address.trim()).map_err(|err| ConfigError::InvalidValue {
            key: "executorConfig.address".into(),
            reason: format!("`{}`: {err}", self.address),
        })
    }

    /// Zero address when unset; the executor boundary then signs as the
    /// executor itself.
    pub fn signer_address(&self) -> Address {
        Address::from_str(self.signer.trim()).unwrap_or(Address::ZERO)
    }

    pub fn default_every(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.every).ok_or_else(|| ConfigError::InvalidValue {
            key: "executorConfig.every".into(),
            reason: self.every.clone(),
        })
    }

    /// Timeout and retry policy for the strategy activity, routed to this
    /// executor's task queue.
    pub fn activity_options(&self) -> Result<ActivityOptions, ConfigError> {
        let maximum_interval =
            parse_duration(&self.maximum_retry_interval).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "executorConfig.maximumRetryInterval".into(),
                    reason: self.maximum_retry_interval.clone(),
                }
            })?;
        let timeout = parse_duration(&self.activity_timeout).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "executorConfig.activityTimeout".into(),
                reason: self.activity_timeout.clone(),
            }
        })?;

        Ok(ActivityOptions {
            task_queue: self.task_queue.clone(),
            start_to_close_timeout: timeout,
            retry: RetryPolicy {
                maximum_attempts: self.retry_attempts,
                maximum_interval,
            },
        })
    }
}

/// Executor configs keyed by address, queryable by strategy id. Immutable
/// after process start.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfigRepo {
    storage: HashMap<Address, ExecutorConfig>,
}

impl ExecutorConfigRepo {
    pub fn new(configs: &[ExecutorConfig]) -> Result<Self, ConfigError> {
        let mut storage = HashMap::with_capacity(configs.len());
        for config in configs {
            storage.insert(config.executor_address()?, config.clone());
        }
        Ok(Self { storage })
    }

    pub fn config(&self, executor: Address) -> Result<&ExecutorConfig, ConfigError> {
        self.storage
            .get(&executor)
            .ok_or(ConfigError::ExecutorNotFound)
    }

    pub fn by_id(&self, id: &str) -> Result<&ExecutorConfig, ConfigError> {
        self.storage
            .values()
            .find(|config| config.id == id)
            .ok_or(ConfigError::ExecutorNotFound)
    }

    pub fn list(&self) -> Vec<ExecutorConfig> {
        self.storage.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub temporal_host: String,
    pub temporal_namespace: String,
    pub console_base_url: String,
    pub chain_rpc_urls: ChainRpcUrls,
    pub executor_configs: Vec<ExecutorConfig>,
    pub sync_subscriptions_every: Duration,
    pub executor_plugin_address: Address,
    pub service_name: String,
    pub host_port: String,
    pub execution_logs_path: String,
}

fn require(source: &dyn ConfigSource, key: &str) -> Result<Value, ConfigError> {
    source
        .get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn require_string(source: &dyn ConfigSource, key: &str) -> Result<String, ConfigError> {
    match require(source, key)? {
        Value::String(raw) => Ok(raw),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected string, got {other}"),
        }),
    }
}

fn string_or(source: &dyn ConfigSource, key: &str, fallback: &str) -> String {
    match source.get(key) {
        Some(Value::String(raw)) if !raw.is_empty() => raw,
        _ => fallback.to_string(),
    }
}

/// Structured values arrive either as JSON values or as JSON-encoded
/// strings; accept both.
fn require_json<T: DeserializeOwned>(
    source: &dyn ConfigSource,
    key: &str,
) -> Result<T, ConfigError> {
    let value = require(source, key)?;
    let decoded = match value {
        Value::String(raw) => serde_json::from_str(&raw),
        other => serde_json::from_value(other),
    };
    decoded.map_err(|err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

impl AppConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let temporal_host = require_string(source, "temporalHost")?;
        let temporal_namespace = string_or(
            source,
            "temporalNameSpace",
            crate::engine::DEFAULT_NAMESPACE,
        );
        let console_base_url = require_string(source, "consoleBaseURL")?;
        let chain_rpc_urls: ChainRpcUrls = require_json(source, "chainID2RPCURLs")?;
        let executor_configs: Vec<ExecutorConfig> = require_json(source, "executorConfig")?;

        let sync_raw = require_string(source, "syncSubscriptionsEvery")?;
        let sync_subscriptions_every =
            parse_duration(&sync_raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "syncSubscriptionsEvery".into(),
                reason: sync_raw,
            })?;

        let plugin_raw = require_string(source, "executorPluginAddress")?;
        let executor_plugin_address =
            Address::from_str(plugin_raw.trim()).map_err(|err| ConfigError::InvalidValue {
                key: "executorPluginAddress".into(),
                reason: format!("`{plugin_raw}`: {err}"),
            })?;

        // Validate executor configs up front so a bad deployment fails at
        // startup, not inside a workflow.
        for config in &executor_configs {
            config.executor_address()?;
            config.default_every()?;
            config.activity_options()?;
        }

        Ok(Self {
            temporal_host,
            temporal_namespace,
            console_base_url,
            chain_rpc_urls,
            executor_configs,
            sync_subscriptions_every,
            executor_plugin_address,
            service_name: string_or(source, "serviceName", "vault-pilot"),
            host_port: string_or(source, "hostPort", ""),
            execution_logs_path: string_or(source, "executionLogsPath", "execution_logs.db"),
        })
    }

    pub fn executor_repo(&self) -> Result<ExecutorConfigRepo, ConfigError> {
        ExecutorConfigRepo::new(&self.executor_configs)
    }
}
