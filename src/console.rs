//! HTTP client for the external console service: executor metadata,
//! subscription registry, and signed-task submission.

use crate::error::ConsoleError;
use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Registry view the reconciling scheduler runs against.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn executor_by_address_and_chain_id(
        &self,
        address: Address,
        chain_id: u64,
    ) -> anyhow::Result<ExecutorMetadata>;

    /// Full list for a registry, active and cancelled both.
    async fn subscriptions(&self, registry_id: &str) -> anyhow::Result<Vec<ClientSubscription>>;
}

pub const SUBSCRIPTION_STATUS_ACTIVE: i32 = 2;
pub const SUBSCRIPTION_STATUS_CANCELLED: i32 = 4;

/// A user-authorized automation agreement as the console reports it.
/// `metadata` stays opaque here; strategy code decodes it into typed params
/// at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientSubscription {
    pub id: String,
    pub sub_account_address: String,
    pub chain_id: u64,
    pub registry_id: String,
    pub status: i32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ClientSubscription {
    pub fn sub_account(&self) -> Option<Address> {
        Address::from_str(self.sub_account_address.trim()).ok()
    }

    pub fn is_active(&self) -> bool {
        self.status == SUBSCRIPTION_STATUS_ACTIVE
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == SUBSCRIPTION_STATUS_CANCELLED
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorMetadata {
    pub id: String,
    pub executor: String,
    #[serde(default)]
    pub chain_id: u64,
    #[serde(default)]
    pub status: i32,
}

#[derive(Debug, Deserialize, Default)]
struct GetExecutorMetadataResp {
    #[serde(default)]
    data: ExecutorMetadata,
}

#[derive(Debug, Deserialize, Default)]
struct GetClientSubscriptionsResp {
    #[serde(default)]
    data: Vec<ClientSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executable {
    pub call_type: u8,
    pub to: String,
    pub value: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub subaccount: String,
    pub executor: String,
    pub executor_signature: String,
    pub executable: Executable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTaskReq {
    pub chain_id: u64,
    pub task: Task,
    #[serde(default)]
    pub webhook: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteTaskRespInner {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub errors: String,
    #[serde(default)]
    pub data: ExecuteTaskId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTaskId {
    #[serde(default)]
    pub task_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteTaskResp {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: ExecuteTaskRespInner,
}

impl ExecuteTaskResp {
    /// Collapse the three-level error envelope into one outcome. Error fields
    /// win over the task id, in priority order `error` > `data.error` >
    /// `data.errors`; an empty envelope is a failure too.
    pub fn into_task_id(self) -> Result<String, ConsoleError> {
        if !self.error.is_empty() {
            return Err(ConsoleError::Task(self.error));
        }
        if !self.data.error.is_empty() {
            return Err(ConsoleError::Task(self.data.error));
        }
        if !self.data.errors.is_empty() {
            return Err(ConsoleError::Task(self.data.errors));
        }
        if !self.data.data.task_id.is_empty() {
            return Ok(self.data.data.task_id);
        }
        Err(ConsoleError::NoTaskId)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConsoleClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn executor_by_address_and_chain_id(
        &self,
        address: Address,
        chain_id: u64,
    ) -> Result<ExecutorMetadata, ConsoleError> {
        let url = format!(
            "{}/v1/automations/executor/{:#x}/{}",
            self.base_url, address, chain_id
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ConsoleError::ExecutorFetch(err.to_string()))?;

        match resp.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::NOT_FOUND => {
                return Err(ConsoleError::ExecutorNotFound(format!("{address:#x}")))
            }
            status => return Err(ConsoleError::ExecutorStatus(status.as_u16())),
        }

        let body: GetExecutorMetadataResp = resp
            .json()
            .await
            .map_err(|err| ConsoleError::ExecutorFetch(err.to_string()))?;
        Ok(body.data)
    }

    /// Full subscription list for a registry, active and cancelled both.
    pub async fn subscriptions(
        &self,
        registry_id: &str,
    ) -> Result<Vec<ClientSubscription>, ConsoleError> {
        let url = format!(
            "{}/v1/automations/executor/{}/subscriptions",
            self.base_url, registry_id
        );
        let body: GetClientSubscriptionsResp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ConsoleError::Subscriptions(err.to_string()))?
            .json()
            .await
            .map_err(|err| ConsoleError::Subscriptions(err.to_string()))?;
        Ok(body.data)
    }

    pub async fn active_subscriptions(
        &self,
        registry_id: &str,
    ) -> Result<Vec<ClientSubscription>, ConsoleError> {
        let subscriptions = self.subscriptions(registry_id).await?;
        Ok(subscriptions
            .into_iter()
            .filter(|sub| !sub.is_cancelled())
            .collect())
    }

    pub async fn execute(&self, req: &ExecuteTaskReq) -> Result<ExecuteTaskResp, ConsoleError> {
        let url = format!(
            "{}/v1/automations/tasks/execute/{}",
            self.base_url, req.chain_id
        );
        tracing::debug!(
            chain_id = req.chain_id,
            subaccount = %req.task.subaccount,
            "submitting executor task"
        );
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|err| ConsoleError::Task(err.to_string()))?;

        let raw = resp
            .bytes()
            .await
            .map_err(|err| ConsoleError::Task(err.to_string()))?;
        serde_json::from_slice(&raw).map_err(|err| ConsoleError::Task(err.to_string()))
    }
}

#[async_trait]
impl SubscriptionSource for ConsoleClient {
    async fn executor_by_address_and_chain_id(
        &self,
        address: Address,
        chain_id: u64,
    ) -> anyhow::Result<ExecutorMetadata> {
        Ok(ConsoleClient::executor_by_address_and_chain_id(self, address, chain_id).await?)
    }

    async fn subscriptions(&self, registry_id: &str) -> anyhow::Result<Vec<ClientSubscription>> {
        Ok(ConsoleClient::subscriptions(self, registry_id).await?)
    }
}
