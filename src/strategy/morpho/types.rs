use crate::executor::SignAndExecuteRequest;
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// Where the user's position sits after a run. The latest log's `current`
/// state is the sole basis for the next run's yield computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutomationState {
    /// Vault the money was deposited into.
    pub target_vault: Address,
    /// Amount deposited into that vault, base-token minor units.
    pub input_amount: String,
    /// Amount transferred out as fees this run.
    pub fees_amount: String,
    /// Yield realized since the previous run, absolute base-token units.
    pub generated_yield: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransitionState {
    pub current: AutomationState,
    #[serde(default)]
    pub prev: Option<AutomationState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub req: Option<SignAndExecuteRequest>,
    pub transition_state: TransitionState,
    #[serde(rename = "taskID", default)]
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLog {
    pub message: String,
    pub metadata: ExecutionMetadata,
}
