//! Schedule domain model and the repository that projects engine schedules
//! into it.

use crate::console::ClientSubscription;
use crate::engine::{memo, ScheduleListEntry, ScheduleStore, SearchAttributeKind};
use crate::error::EngineError;
use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub const SEARCH_ATTR_SUB_ACCOUNT_ADDRESS: &str = "subAccountAddress";
pub const SEARCH_ATTR_EXECUTOR_ADDRESS: &str = "executorAddress";
pub const SEARCH_ATTR_CHAIN_ID: &str = "chainID";
pub const SEARCH_ATTR_EXECUTOR_ID: &str = "executorID";

pub const SEARCH_ATTRIBUTES: [(&str, SearchAttributeKind); 4] = [
    (SEARCH_ATTR_SUB_ACCOUNT_ADDRESS, SearchAttributeKind::Keyword),
    (SEARCH_ATTR_EXECUTOR_ADDRESS, SearchAttributeKind::Keyword),
    (SEARCH_ATTR_CHAIN_ID, SearchAttributeKind::Int),
    (SEARCH_ATTR_EXECUTOR_ID, SearchAttributeKind::Keyword),
];

const MAX_PAGE_SIZE: u32 = 100;

/// The full memo payload a schedule carries: everything a fire needs to run
/// the orchestrator workflow without consulting the registry again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecuteWorkflowParams {
    /// Reserved; carried through the memo but not consumed yet.
    #[serde(default)]
    pub nonce: u64,
    pub params: OrchestratorParams,
    #[serde(default)]
    pub schedule: Option<ScheduledWorkflowConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorParams {
    pub executor_address: Address,
    pub sub_account_address: Address,
    #[serde(rename = "executorID")]
    pub executor_id: String,
    #[serde(rename = "chainID")]
    pub chain_id: u64,
    pub subscription: ClientSubscription,
}

impl OrchestratorParams {
    /// Deterministic schedule id: 32-byte digest over
    /// `subAccount ∥ executor ∥ chainId(LE)`, hex-encoded. Equal params give
    /// equal ids; distinct `(subAccount, executor, chainId)` triples give
    /// distinct ids.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sub_account_address.as_slice());
        hasher.update(self.executor_address.as_slice());
        hasher.update(self.chain_id.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScheduledWorkflowConfig {
    #[serde(default)]
    pub every: Duration,
    #[serde(default)]
    pub id: String,
}

/// Per-fire execution context read back from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScheduleCtx {
    #[serde(rename = "executionCount")]
    pub execution_count: u64,
    #[serde(rename = "prevExecutionAt", default)]
    pub prev_execution_at: Option<DateTime<Utc>>,
    #[serde(rename = "prevExecutionID", default)]
    pub prev_execution_id: String,
    #[serde(rename = "runningExecutionWorkflowIDs", default)]
    pub running_execution_workflow_ids: Vec<String>,
}

/// Strategy-activity input assembled by the orchestrator workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCtx {
    pub schedule_ctx: ScheduleCtx,
    pub execute_workflow_params: ExecuteWorkflowParams,
    pub triggered_at: DateTime<Utc>,
}

/// Custom cadence override carried in subscription metadata. `Every` is a
/// duration string, falling back to integer seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomIntervalOptions {
    #[serde(rename = "Every", default)]
    pub every: String,
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub config: ExecuteWorkflowParams,
    pub schedule_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Projection of engine schedules as domain objects, addressed by search
/// query.
#[derive(Clone)]
pub struct ScheduleRepo {
    store: Arc<dyn ScheduleStore>,
}

impl ScheduleRepo {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    pub async fn by_sub_account_and_chain_id(
        &self,
        sub_account: Address,
        chain_id: u64,
    ) -> Result<Vec<Schedule>, EngineError> {
        let query = format!(
            "{} = '{}' AND {} = {}",
            SEARCH_ATTR_SUB_ACCOUNT_ADDRESS,
            sub_account.to_checksum(None),
            SEARCH_ATTR_CHAIN_ID,
            chain_id
        );
        self.list(&query).await
    }

    /// Advanced-query form over a set of sub-accounts. Zero addresses means
    /// zero results and no query issued.
    pub async fn by_sub_accounts_and_chain_id(
        &self,
        sub_accounts: &[Address],
        chain_id: u64,
    ) -> Result<Vec<Schedule>, EngineError> {
        if sub_accounts.is_empty() {
            return Ok(Vec::new());
        }

        let quoted = sub_accounts
            .iter()
            .map(|addr| format!("'{}'", addr.to_checksum(None)))
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "{} IN ({}) AND {} = {}",
            SEARCH_ATTR_SUB_ACCOUNT_ADDRESS, quoted, SEARCH_ATTR_CHAIN_ID, chain_id
        );
        self.list(&query).await
    }

    async fn list(&self, query: &str) -> Result<Vec<Schedule>, EngineError> {
        let mut schedules = Vec::new();
        let mut page_token = String::new();
        loop {
            let (entries, next) = self
                .store
                .list_schedules(query, MAX_PAGE_SIZE, &page_token)
                .await?;
            for entry in &entries {
                schedules.push(parse_schedule_entry(entry)?);
            }
            if next.is_empty() {
                break;
            }
            page_token = next;
        }
        Ok(schedules)
    }
}

fn parse_schedule_entry(entry: &ScheduleListEntry) -> Result<Schedule, EngineError> {
    let mut config = ExecuteWorkflowParams::default();
    if let Some(envelope) = &entry.memo {
        if let Some(params) = memo::decode_field::<OrchestratorParams>(envelope, "params")? {
            config.params = params;
        }
        config.schedule =
            memo::decode_field::<Option<ScheduledWorkflowConfig>>(envelope, "schedule")?.flatten();
    }

    Ok(Schedule {
        config,
        schedule_id: entry.schedule_id.clone(),
        created_at: entry.start_at,
    })
}
