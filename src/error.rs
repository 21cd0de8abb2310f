use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid chain id")]
    InvalidChainId,
    #[error("failed to call all upstreams")]
    FailedToCallAllUpstreams,
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("bad request")]
    BadRequest,
    #[error("failed to call rpc")]
    CallFailed,
    #[error("invalid response from upstream")]
    InvalidUpstreamResponse,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine transport failure: {0}")]
    Transport(String),
    #[error("engine rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed schedule memo: {0}")]
    MalformedMemo(String),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),
    #[error("task queue poll failed: {0}")]
    Poll(String),
    #[error("activity failed: {message}")]
    ActivityFailed { message: String, non_retryable: bool },
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("failed to fetch executor by address: {0}")]
    ExecutorFetch(String),
    #[error("executor not found: {0}")]
    ExecutorNotFound(String),
    #[error("failed to fetch executor: {0}")]
    ExecutorStatus(u16),
    #[error("failed to get executor subscriptions: {0}")]
    Subscriptions(String),
    #[error("{0}")]
    Task(String),
    #[error("failed to execute task")]
    NoTaskId,
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("remote signer failure: {0}")]
    Remote(String),
    #[error("failed to parse signed signature")]
    MalformedSignature,
    #[error("signature too short: {0} bytes")]
    ShortSignature(usize),
}

/// Strategy-activity failures. `is_non_retryable` marks the deterministic
/// preconditions that cannot be fixed by a retry within the same fire.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("input does not cover base fees want={want} have={have}")]
    InsufficientBalance { want: String, have: String },
    #[error("vault not whitelisted {0}")]
    VaultNotWhitelisted(String),
    #[error("no execution log found for subscription {0}")]
    MissingExecutionLog(String),
    #[error("failed to unmarshal strategy params: {0}")]
    MalformedParams(String),
    #[error("failed to parse base fee {0}")]
    MalformedFee(String),
    #[error("failed to parse vault deposit amount {0}")]
    MalformedDepositAmount(String),
}

impl StrategyError {
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            StrategyError::InsufficientBalance { .. }
                | StrategyError::VaultNotWhitelisted(_)
                | StrategyError::MissingExecutionLog(_)
                | StrategyError::MalformedParams(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingKey(String),
    #[error("invalid configuration `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("executor not found")]
    ExecutorNotFound,
}

#[cfg(test)]
mod tests {
    use super::StrategyError;

    #[test]
    fn test_precondition_errors_are_non_retryable() {
        assert!(StrategyError::InsufficientBalance {
            want: "2".into(),
            have: "1".into()
        }
        .is_non_retryable());
        assert!(StrategyError::VaultNotWhitelisted("0xdead".into()).is_non_retryable());
        assert!(StrategyError::MissingExecutionLog("sub".into()).is_non_retryable());
        assert!(!StrategyError::MalformedFee("x".into()).is_non_retryable());
    }
}
