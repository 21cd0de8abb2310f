//! Orchestrator workflow and the context activity it runs first.
//!
//! The workflow body is a durable coordinator: everything it does is either
//! deterministic or an activity invocation, so the engine can replay it
//! after a crash up to the last recorded activity result.

use crate::config::ExecutorConfigRepo;
use crate::engine::{
    ActivityHandler, ActivityOptions, RetryPolicy, ScheduleStore, WorkflowContext,
    WorkflowHandler, BASE_TASK_QUEUE,
};
use crate::schedule::{ExecCtx, ExecuteWorkflowParams, ScheduleCtx};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const ORCHESTRATOR_WORKFLOW: &str = "OrchestratorWorkflow";
pub const GET_EXECUTION_CONTEXT_ACTIVITY: &str = "GetExecutionContext";
pub const EXECUTION_HANDLER_ACTIVITY: &str = "ExecutionHandler";

/// Single attempt: retrying a read that feeds later deterministic steps
/// would break replay.
pub fn context_activity_options() -> ActivityOptions {
    ActivityOptions {
        task_queue: BASE_TASK_QUEUE.to_string(),
        start_to_close_timeout: Duration::from_secs(10),
        retry: RetryPolicy {
            maximum_attempts: 1,
            maximum_interval: Duration::from_secs(10),
        },
    }
}

pub struct Orchestrator {
    config: ExecutorConfigRepo,
}

impl Orchestrator {
    pub fn new(config: ExecutorConfigRepo) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkflowHandler for Orchestrator {
    async fn run(&self, ctx: WorkflowContext, input: Value) -> anyhow::Result<Value> {
        let workflow_id = ctx.workflow_id.clone();
        tracing::info!(workflow_id = %workflow_id, "starting orchestrator workflow");

        let config: ExecuteWorkflowParams = serde_json::from_value(input)
            .map_err(|err| anyhow::anyhow!("malformed workflow input: {err}"))?;
        let Some(schedule) = &config.schedule else {
            anyhow::bail!("workflow is not scheduled");
        };

        let schedule_ctx_raw = ctx
            .execute_activity(
                &context_activity_options(),
                GET_EXECUTION_CONTEXT_ACTIVITY,
                Value::String(schedule.id.clone()),
            )
            .await
            .map_err(|err| {
                tracing::error!(workflow_id = %workflow_id, error = %err, "failed to get execution context");
                err
            })?;
        let schedule_ctx: ScheduleCtx = serde_json::from_value(schedule_ctx_raw)
            .map_err(|err| anyhow::anyhow!("malformed schedule context: {err}"))?;

        let executor_config = self
            .config
            .config(config.params.executor_address)
            .map_err(|err| {
                tracing::error!(workflow_id = %workflow_id, error = %err, "failed to get executor config");
                anyhow::Error::from(err)
            })?;
        let activity_options = executor_config.activity_options()?;

        let exec_ctx = ExecCtx {
            schedule_ctx,
            execute_workflow_params: config.clone(),
            triggered_at: ctx.started_at,
        };
        ctx.execute_activity(
            &activity_options,
            EXECUTION_HANDLER_ACTIVITY,
            serde_json::to_value(&exec_ctx)?,
        )
        .await
        .map_err(|err| {
            tracing::error!(workflow_id = %workflow_id, error = %err, "execution handler failed");
            err
        })?;

        tracing::info!(workflow_id = %workflow_id, "orchestrator workflow completed successfully");
        Ok(Value::Null)
    }
}

/// Reads the schedule's state off the engine and shapes it into the fire's
/// execution context.
pub struct ContextActivity {
    store: Arc<dyn ScheduleStore>,
}

impl ContextActivity {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActivityHandler for ContextActivity {
    async fn run(&self, input: Value) -> anyhow::Result<Value> {
        let schedule_id: String = serde_json::from_value(input)
            .map_err(|err| anyhow::anyhow!("malformed schedule id: {err}"))?;
        let description = self.store.describe_schedule(&schedule_id).await?;

        let mut execution_ctx = ScheduleCtx {
            execution_count: description.num_actions + 1,
            ..Default::default()
        };

        // the engine lists the currently-running workflow first; skip it
        for (idx, workflow) in description.running_workflows.iter().enumerate() {
            if idx == 0 {
                continue;
            }
            execution_ctx
                .running_execution_workflow_ids
                .push(workflow.workflow_id.clone());
        }

        if let Some(latest) = description.recent_actions.last() {
            execution_ctx.prev_execution_id = latest.workflow_id.clone();
            execution_ctx.prev_execution_at = latest.actual_time;
        }

        Ok(serde_json::to_value(execution_ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::console::ClientSubscription;
    use crate::engine::{
        EngineTask, ScheduleActionResult, ScheduleDescription, ScheduleListEntry,
        ScheduleOptions, SearchAttributeKind, TaskTransport, WorkflowExecutionRef,
    };
    use crate::error::EngineError;
    use crate::schedule::{OrchestratorParams, ScheduledWorkflowConfig};
    use alloy::primitives::{address, Address};
    use chrono::Utc;
    use std::sync::Mutex;

    const EXECUTOR: Address = address!("cF77a3Ba9A5CA399B7c97c74d54e5b1Beb874E43");

    fn executor_repo() -> ExecutorConfigRepo {
        ExecutorConfigRepo::new(&[ExecutorConfig {
            activity_timeout: "5m".into(),
            task_queue: "morpho-task-queue".into(),
            retry_attempts: 3,
            maximum_retry_interval: "1m".into(),
            chain_id: 8453,
            address: EXECUTOR.to_checksum(None),
            signer: String::new(),
            every: "10m".into(),
            strategy_config: Value::Null,
            id: "morpho-rebalancer-base".into(),
        }])
        .expect("repo")
    }

    fn workflow_input(with_schedule: bool) -> Value {
        serde_json::to_value(ExecuteWorkflowParams {
            nonce: 0,
            params: OrchestratorParams {
                executor_address: EXECUTOR,
                sub_account_address: address!("A238Dd80C259a72e81d7e4664a9801593F98d1c5"),
                executor_id: "registry-1".into(),
                chain_id: 8453,
                subscription: ClientSubscription::default(),
            },
            schedule: with_schedule.then(|| ScheduledWorkflowConfig {
                every: Duration::from_secs(600),
                id: "sched-1".into(),
            }),
        })
        .expect("input")
    }

    #[derive(Default)]
    struct ScriptedTransport {
        dispatches: Mutex<Vec<(String, ActivityOptions, Value)>>,
        results: Mutex<Vec<Result<Value, EngineError>>>,
    }

    #[async_trait]
    impl TaskTransport for ScriptedTransport {
        async fn poll_task(&self, _task_queue: &str) -> Result<Option<EngineTask>, EngineError> {
            Ok(None)
        }
        async fn complete_task(&self, _token: &str, _result: Value) -> Result<(), EngineError> {
            Ok(())
        }
        async fn fail_task(
            &self,
            _token: &str,
            _message: &str,
            _non_retryable: bool,
        ) -> Result<(), EngineError> {
            Ok(())
        }
        async fn dispatch_activity(
            &self,
            activity_type: &str,
            input: Value,
            options: &ActivityOptions,
        ) -> Result<String, EngineError> {
            self.dispatches.lock().unwrap().push((
                activity_type.to_string(),
                options.clone(),
                input,
            ));
            Ok(format!("act-{}", self.dispatches.lock().unwrap().len()))
        }
        async fn await_activity(&self, _activity_id: &str) -> Result<Value, EngineError> {
            self.results.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn test_orchestrator_runs_both_activities() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.results.lock().unwrap().push(Ok(serde_json::to_value(
            ScheduleCtx {
                execution_count: 4,
                ..Default::default()
            },
        )
        .unwrap()));
        transport.results.lock().unwrap().push(Ok(Value::Null));

        let orchestrator = Orchestrator::new(executor_repo());
        let ctx = WorkflowContext::new(transport.clone(), "wf-1".into(), Utc::now());
        orchestrator
            .run(ctx, workflow_input(true))
            .await
            .expect("workflow");

        let dispatches = transport.dispatches.lock().unwrap();
        assert_eq!(dispatches.len(), 2);

        // context activity: base queue, 10s, single attempt
        let (activity, options, input) = &dispatches[0];
        assert_eq!(activity, GET_EXECUTION_CONTEXT_ACTIVITY);
        assert_eq!(options.task_queue, BASE_TASK_QUEUE);
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(10));
        assert_eq!(options.retry.maximum_attempts, 1);
        assert_eq!(input, &Value::String("sched-1".into()));

        // strategy activity: executor config's queue and retry policy
        let (activity, options, input) = &dispatches[1];
        assert_eq!(activity, EXECUTION_HANDLER_ACTIVITY);
        assert_eq!(options.task_queue, "morpho-task-queue");
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(300));
        assert_eq!(options.retry.maximum_attempts, 3);
        let exec_ctx: ExecCtx = serde_json::from_value(input.clone()).expect("exec ctx");
        assert_eq!(exec_ctx.schedule_ctx.execution_count, 4);
        assert_eq!(
            exec_ctx.execute_workflow_params.params.executor_address,
            EXECUTOR
        );
    }

    #[tokio::test]
    async fn test_orchestrator_requires_schedule() {
        let transport = Arc::new(ScriptedTransport::default());
        let orchestrator = Orchestrator::new(executor_repo());
        let ctx = WorkflowContext::new(transport.clone(), "wf-1".into(), Utc::now());

        let err = orchestrator
            .run(ctx, workflow_input(false))
            .await
            .expect_err("must fail without schedule");
        assert!(err.to_string().contains("not scheduled"));
        assert!(transport.dispatches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orchestrator_fails_on_unknown_executor() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .results
            .lock()
            .unwrap()
            .push(Ok(serde_json::to_value(ScheduleCtx::default()).unwrap()));

        let orchestrator = Orchestrator::new(ExecutorConfigRepo::default());
        let ctx = WorkflowContext::new(transport.clone(), "wf-1".into(), Utc::now());
        let err = orchestrator
            .run(ctx, workflow_input(true))
            .await
            .expect_err("unknown executor");
        assert!(err.to_string().contains("executor not found"));
    }

    struct FixedStore {
        description: ScheduleDescription,
    }

    #[async_trait]
    impl ScheduleStore for FixedStore {
        async fn register_search_attributes(
            &self,
            _attributes: &[(&str, SearchAttributeKind)],
        ) -> Result<(), EngineError> {
            Ok(())
        }
        async fn create_schedule(&self, _options: &ScheduleOptions) -> Result<String, EngineError> {
            unreachable!()
        }
        async fn delete_schedule(&self, _schedule_id: &str) -> Result<(), EngineError> {
            unreachable!()
        }
        async fn list_schedules(
            &self,
            _query: &str,
            _page_size: u32,
            _next_page_token: &str,
        ) -> Result<(Vec<ScheduleListEntry>, String), EngineError> {
            unreachable!()
        }
        async fn describe_schedule(
            &self,
            _schedule_id: &str,
        ) -> Result<ScheduleDescription, EngineError> {
            Ok(self.description.clone())
        }
    }

    #[tokio::test]
    async fn test_context_activity_shapes_description() {
        let when = Utc::now();
        let store = FixedStore {
            description: ScheduleDescription {
                num_actions: 3,
                recent_actions: vec![
                    ScheduleActionResult {
                        workflow_id: "wf-old".into(),
                        actual_time: None,
                    },
                    ScheduleActionResult {
                        workflow_id: "wf-prev".into(),
                        actual_time: Some(when),
                    },
                ],
                running_workflows: vec![
                    WorkflowExecutionRef {
                        workflow_id: "wf-current".into(),
                    },
                    WorkflowExecutionRef {
                        workflow_id: "wf-straggler".into(),
                    },
                ],
            },
        };

        let activity = ContextActivity::new(Arc::new(store));
        let raw = activity
            .run(Value::String("sched-1".into()))
            .await
            .expect("context");
        let ctx: ScheduleCtx = serde_json::from_value(raw).expect("decode");

        assert_eq!(ctx.execution_count, 4);
        assert_eq!(ctx.prev_execution_id, "wf-prev");
        assert_eq!(ctx.prev_execution_at, Some(when));
        // the first running workflow is this fire itself
        assert_eq!(ctx.running_execution_workflow_ids, vec!["wf-straggler"]);
    }

    #[tokio::test]
    async fn test_context_activity_empty_description() {
        let activity = ContextActivity::new(Arc::new(FixedStore {
            description: ScheduleDescription::default(),
        }));
        let raw = activity
            .run(Value::String("sched-1".into()))
            .await
            .expect("context");
        let ctx: ScheduleCtx = serde_json::from_value(raw).expect("decode");
        assert_eq!(ctx.execution_count, 1);
        assert!(ctx.prev_execution_id.is_empty());
        assert!(ctx.running_execution_workflow_ids.is_empty());
    }
}
