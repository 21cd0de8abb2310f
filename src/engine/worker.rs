//! Worker harness: binds workflow and activity handlers to one task queue
//! and drains it until the process is interrupted.

use crate::engine::{ActivityOptions, EngineTask, TaskKind, TaskTransport};
use crate::error::{EngineError, StrategyError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_CONCURRENCY: usize = 8;
const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(500);
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Handed to workflow handlers. The only I/O a workflow body may perform is
/// `execute_activity`; everything else must be deterministic so the engine
/// can replay the history.
#[derive(Clone)]
pub struct WorkflowContext {
    transport: Arc<dyn TaskTransport>,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(
        transport: Arc<dyn TaskTransport>,
        workflow_id: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transport,
            workflow_id,
            started_at,
        }
    }

    pub async fn execute_activity(
        &self,
        options: &ActivityOptions,
        activity_type: &str,
        input: Value,
    ) -> Result<Value, EngineError> {
        let activity_id = self
            .transport
            .dispatch_activity(activity_type, input, options)
            .await?;
        self.transport.await_activity(&activity_id).await
    }
}

#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn run(&self, ctx: WorkflowContext, input: Value) -> anyhow::Result<Value>;
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn run(&self, input: Value) -> anyhow::Result<Value>;
}

pub struct Worker {
    transport: Arc<dyn TaskTransport>,
    task_queue: String,
    workflows: HashMap<String, Arc<dyn WorkflowHandler>>,
    activities: HashMap<String, Arc<dyn ActivityHandler>>,
    concurrency: usize,
}

impl Worker {
    pub fn new(transport: Arc<dyn TaskTransport>, task_queue: &str) -> Self {
        Self {
            transport,
            task_queue: task_queue.to_string(),
            workflows: HashMap::new(),
            activities: HashMap::new(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn register_workflow(&mut self, workflow_type: &str, handler: Arc<dyn WorkflowHandler>) {
        self.workflows.insert(workflow_type.to_string(), handler);
    }

    pub fn register_activity(&mut self, activity_type: &str, handler: Arc<dyn ActivityHandler>) {
        self.activities.insert(activity_type.to_string(), handler);
    }

    /// Poll-dispatch loop. Returns on SIGINT; in-flight tasks finish on the
    /// runtime before the process exits.
    pub async fn run(self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let workflows = Arc::new(self.workflows);
        let activities = Arc::new(self.activities);
        tracing::info!(
            task_queue = %self.task_queue,
            workflows = workflows.len(),
            activities = activities.len(),
            concurrency = self.concurrency,
            "worker started"
        );

        loop {
            let permit = semaphore.clone().acquire_owned().await?;

            let polled = tokio::select! {
                polled = self.transport.poll_task(&self.task_queue) => polled,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(task_queue = %self.task_queue, "worker interrupted");
                    return Ok(());
                }
            };

            match polled {
                Ok(Some(task)) => {
                    let transport = self.transport.clone();
                    let workflows = workflows.clone();
                    let activities = activities.clone();
                    tokio::spawn(async move {
                        process_task(transport, workflows, activities, task).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(EMPTY_POLL_BACKOFF).await;
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(task_queue = %self.task_queue, error = %err, "task poll failed");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn process_task(
    transport: Arc<dyn TaskTransport>,
    workflows: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
    activities: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
    task: EngineTask,
) {
    let token = task.token.clone();
    let outcome = match task.kind {
        TaskKind::Workflow {
            workflow_type,
            workflow_id,
            started_at,
            input,
        } => match workflows.get(&workflow_type) {
            Some(handler) => {
                let ctx = WorkflowContext::new(transport.clone(), workflow_id, started_at);
                handler.run(ctx, input).await
            }
            None => Err(anyhow::anyhow!(
                "workflow type not registered: {workflow_type}"
            )),
        },
        TaskKind::Activity {
            activity_type,
            input,
        } => match activities.get(&activity_type) {
            Some(handler) => handler.run(input).await,
            None => Err(anyhow::anyhow!(
                "activity type not registered: {activity_type}"
            )),
        },
    };

    let report = match outcome {
        Ok(result) => transport.complete_task(&token, result).await,
        Err(err) => {
            let non_retryable = is_non_retryable(&err);
            tracing::warn!(error = %err, non_retryable, "task failed");
            transport
                .fail_task(&token, &err.to_string(), non_retryable)
                .await
        }
    };
    if let Err(err) = report {
        tracing::error!(error = %err, "failed to report task outcome");
    }
}

/// Deterministic strategy preconditions must not be retried by the engine; a
/// workflow that died on a failed non-retryable activity is final too.
fn is_non_retryable(err: &anyhow::Error) -> bool {
    if let Some(strategy) = err.downcast_ref::<StrategyError>() {
        return strategy.is_non_retryable();
    }
    if let Some(EngineError::ActivityFailed { non_retryable, .. }) =
        err.downcast_ref::<EngineError>()
    {
        return *non_retryable;
    }
    false
}
