//! Interface to the external workflow engine.
//!
//! The engine owns schedules, workflow histories and search attributes; this
//! crate only projects them. Two seams: [`ScheduleStore`] for the control
//! plane (scheduler daemon, schedule repository, context activity) and
//! [`TaskTransport`] for the workers that execute workflow fires and
//! activity invocations off the engine's task queues.

pub mod client;
pub mod memo;
pub mod worker;

pub use client::EngineClient;
pub use worker::{ActivityHandler, Worker, WorkflowContext, WorkflowHandler};

use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const BASE_TASK_QUEUE: &str = "base-task-queue";
pub const DEFAULT_NAMESPACE: &str = "brahma-builder";

/// Engine-side retention for finished workflow histories.
pub const WORKFLOW_EXECUTION_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Drop a fire whose schedule still has a prior fire running.
    Skip,
}

impl OverlapPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverlapPolicy::Skip => "SCHEDULE_OVERLAP_POLICY_SKIP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAttributeKind {
    Keyword,
    Int,
}

impl SearchAttributeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchAttributeKind::Keyword => "Keyword",
            SearchAttributeKind::Int => "Int",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub maximum_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub task_queue: String,
    pub start_to_close_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Everything the engine needs to create one durable schedule.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub id: String,
    pub every: Duration,
    pub task_queue: String,
    pub workflow_type: String,
    pub args: Value,
    pub memo: BTreeMap<String, Value>,
    pub search_attributes: BTreeMap<String, Value>,
    pub note: String,
    pub overlap: OverlapPolicy,
    pub trigger_immediately: bool,
    pub pause_on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleListEntry {
    pub schedule_id: String,
    /// Raw memo envelope as the engine returns it; `memo::decode_field`
    /// extracts the base64-JSON payloads.
    pub memo: Option<Value>,
    pub start_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleActionResult {
    pub workflow_id: String,
    pub actual_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowExecutionRef {
    pub workflow_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleDescription {
    pub num_actions: u64,
    pub recent_actions: Vec<ScheduleActionResult>,
    pub running_workflows: Vec<WorkflowExecutionRef>,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Idempotent: an "already exists" reply from the engine is not an error.
    async fn register_search_attributes(
        &self,
        attributes: &[(&str, SearchAttributeKind)],
    ) -> Result<(), EngineError>;

    async fn create_schedule(&self, options: &ScheduleOptions) -> Result<String, EngineError>;

    async fn delete_schedule(&self, schedule_id: &str) -> Result<(), EngineError>;

    /// One page of the visibility listing. Callers drive pagination through
    /// `next_page_token` until it comes back empty.
    async fn list_schedules(
        &self,
        query: &str,
        page_size: u32,
        next_page_token: &str,
    ) -> Result<(Vec<ScheduleListEntry>, String), EngineError>;

    async fn describe_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<ScheduleDescription, EngineError>;
}

/// A unit of work handed to a worker from a task queue.
#[derive(Debug, Clone)]
pub struct EngineTask {
    pub token: String,
    pub kind: TaskKind,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Workflow {
        workflow_type: String,
        workflow_id: String,
        started_at: DateTime<Utc>,
        input: Value,
    },
    Activity {
        activity_type: String,
        input: Value,
    },
}

#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Long-poll one task queue. `None` means the poll timed out empty.
    async fn poll_task(&self, task_queue: &str) -> Result<Option<EngineTask>, EngineError>;

    async fn complete_task(&self, token: &str, result: Value) -> Result<(), EngineError>;

    async fn fail_task(
        &self,
        token: &str,
        message: &str,
        non_retryable: bool,
    ) -> Result<(), EngineError>;

    /// Hand an activity invocation to the engine for routed execution with
    /// the engine-side retry policy in `options`.
    async fn dispatch_activity(
        &self,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> Result<String, EngineError>;

    /// Block until the dispatched activity reaches a terminal state.
    async fn await_activity(&self, activity_id: &str) -> Result<Value, EngineError>;
}
