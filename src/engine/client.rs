//! HTTP client for the workflow-engine gateway.
//!
//! Implements both seams: [`ScheduleStore`] against the schedule endpoints
//! and [`TaskTransport`] against the task-queue endpoints. All routes live
//! under `/api/v1/namespaces/{namespace}/`.

use crate::engine::{
    memo, ActivityOptions, EngineTask, ScheduleActionResult, ScheduleDescription,
    ScheduleListEntry, ScheduleOptions, ScheduleStore, SearchAttributeKind, TaskKind,
    TaskTransport, WorkflowExecutionRef, WORKFLOW_EXECUTION_RETENTION,
};
use crate::error::EngineError;
use crate::utils::format_duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

const POLL_WAIT: Duration = Duration::from_secs(30);
const RESULT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EngineClient {
    base_url: String,
    namespace: String,
    client: reqwest::Client,
}

impl EngineClient {
    pub fn new(host: &str, namespace: &str) -> anyhow::Result<Self> {
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        // Long-poll endpoints hold the connection open; the client timeout
        // must sit above the engine-side wait.
        let client = reqwest::Client::builder()
            .timeout(RESULT_WAIT + Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base_url: base,
            namespace: namespace.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/{}",
            self.base_url, self.namespace, path
        )
    }

    /// Register the namespace with the default retention. Exists-already
    /// replies are fine: every process races on startup.
    pub async fn register_namespace(&self) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(format!("{}/api/v1/namespaces", self.base_url))
            .json(&json!({
                "namespace": self.namespace,
                "workflowExecutionRetentionPeriod": format_duration(WORKFLOW_EXECUTION_RETENTION),
            }))
            .send()
            .await
            .map_err(|err| EngineError::Transport(err.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if body.contains("already exists") {
            return Ok(());
        }
        Err(EngineError::Rejected { status, body })
    }

    async fn send_json(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<(reqwest::StatusCode, Value), EngineError> {
        let resp = req
            .send()
            .await
            .map_err(|err| EngineError::Transport(err.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok((status, Value::Null));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| EngineError::Transport(err.to_string()))?;
        if body.is_empty() {
            return Ok((status, Value::Null));
        }
        let value = serde_json::from_slice(&body)
            .map_err(|err| EngineError::Transport(format!("malformed engine reply: {err}")))?;
        Ok((status, value))
    }

    fn ensure_ok(status: reqwest::StatusCode, body: &Value) -> Result<(), EngineError> {
        if status.is_success() {
            return Ok(());
        }
        Err(EngineError::Rejected {
            status: status.as_u16(),
            body: body.to_string(),
        })
    }
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
}

fn parse_schedule_entry(entry: &Value) -> ScheduleListEntry {
    ScheduleListEntry {
        schedule_id: entry
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        memo: entry.get("memo").cloned().filter(|memo| !memo.is_null()),
        start_at: parse_time(entry.pointer("/info/spec/startTime")),
    }
}

fn parse_description(body: &Value) -> ScheduleDescription {
    let info = body.get("info").cloned().unwrap_or(Value::Null);
    let recent_actions = info
        .get("recentActions")
        .and_then(|v| v.as_array())
        .map(|actions| {
            actions
                .iter()
                .map(|action| ScheduleActionResult {
                    workflow_id: action
                        .pointer("/startWorkflowResult/workflowId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    actual_time: parse_time(action.get("actualTime")),
                })
                .collect()
        })
        .unwrap_or_default();
    let running_workflows = info
        .get("runningWorkflows")
        .and_then(|v| v.as_array())
        .map(|workflows| {
            workflows
                .iter()
                .map(|workflow| WorkflowExecutionRef {
                    workflow_id: workflow
                        .get("workflowId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    ScheduleDescription {
        num_actions: info
            .get("numActions")
            .and_then(|v| v.as_u64())
            .unwrap_or_default(),
        recent_actions,
        running_workflows,
    }
}

#[async_trait]
impl ScheduleStore for EngineClient {
    async fn register_search_attributes(
        &self,
        attributes: &[(&str, SearchAttributeKind)],
    ) -> Result<(), EngineError> {
        let mut body = serde_json::Map::new();
        for (key, kind) in attributes {
            body.insert((*key).to_string(), Value::String(kind.as_str().to_string()));
        }

        let (status, reply) = self
            .send_json(
                self.client
                    .post(self.url("search-attributes"))
                    .json(&json!({ "searchAttributes": Value::Object(body) })),
            )
            .await?;
        if status.is_success() || reply.to_string().contains("already exists") {
            tracing::info!(namespace = %self.namespace, "search attributes registered");
            return Ok(());
        }
        Self::ensure_ok(status, &reply)
    }

    async fn create_schedule(&self, options: &ScheduleOptions) -> Result<String, EngineError> {
        let memo_envelope = memo::encode_envelope(&options.memo)?;
        let body = json!({
            "schedule": {
                "spec": {
                    "intervals": [ { "interval": format_duration(options.every) } ],
                },
                "action": {
                    "startWorkflow": {
                        "workflowType": { "name": options.workflow_type },
                        "taskQueue": { "name": options.task_queue },
                        "input": [ options.args ],
                        "memo": memo_envelope,
                        "searchAttributes": {
                            "indexedFields": options.search_attributes,
                        },
                    },
                },
                "policies": {
                    "overlapPolicy": options.overlap.as_str(),
                    "pauseOnFailure": options.pause_on_failure,
                },
                "state": { "notes": options.note },
            },
            "memo": memo_envelope,
            "searchAttributes": { "indexedFields": options.search_attributes },
            "initialPatch": if options.trigger_immediately {
                json!({ "triggerImmediately": { "overlapPolicy": options.overlap.as_str() } })
            } else {
                Value::Null
            },
        });

        let (status, reply) = self
            .send_json(
                self.client
                    .post(self.url(&format!("schedules/{}", options.id)))
                    .json(&body),
            )
            .await?;
        Self::ensure_ok(status, &reply)?;
        Ok(options.id.clone())
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
        let (status, reply) = self
            .send_json(
                self.client
                    .delete(self.url(&format!("schedules/{schedule_id}"))),
            )
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::ScheduleNotFound(schedule_id.to_string()));
        }
        Self::ensure_ok(status, &reply)
    }

    async fn list_schedules(
        &self,
        query: &str,
        page_size: u32,
        next_page_token: &str,
    ) -> Result<(Vec<ScheduleListEntry>, String), EngineError> {
        let page_size = page_size.to_string();
        let (status, reply) = self
            .send_json(
                self.client
                    .get(self.url("schedules"))
                    .query(&[
                        ("query", query),
                        ("maximumPageSize", page_size.as_str()),
                        ("nextPageToken", next_page_token),
                    ]),
            )
            .await?;
        Self::ensure_ok(status, &reply)?;

        let entries = reply
            .get("schedules")
            .and_then(|v| v.as_array())
            .map(|schedules| schedules.iter().map(parse_schedule_entry).collect())
            .unwrap_or_default();
        let token = reply
            .get("nextPageToken")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok((entries, token))
    }

    async fn describe_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<ScheduleDescription, EngineError> {
        let (status, reply) = self
            .send_json(
                self.client
                    .get(self.url(&format!("schedules/{schedule_id}"))),
            )
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::ScheduleNotFound(schedule_id.to_string()));
        }
        Self::ensure_ok(status, &reply)?;
        Ok(parse_description(&reply))
    }
}

fn parse_task(reply: &Value) -> Result<Option<EngineTask>, EngineError> {
    if reply.is_null() {
        return Ok(None);
    }
    let token = reply
        .get("taskToken")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if token.is_empty() {
        return Ok(None);
    }

    if let Some(workflow) = reply.get("workflow") {
        let kind = TaskKind::Workflow {
            workflow_type: workflow
                .pointer("/workflowType/name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            workflow_id: workflow
                .get("workflowId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            started_at: parse_time(workflow.get("startedTime")).unwrap_or_else(Utc::now),
            input: workflow
                .get("input")
                .and_then(|v| v.as_array())
                .and_then(|args| args.first().cloned())
                .unwrap_or(Value::Null),
        };
        return Ok(Some(EngineTask { token, kind }));
    }

    if let Some(activity) = reply.get("activity") {
        let kind = TaskKind::Activity {
            activity_type: activity
                .pointer("/activityType/name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            input: activity.get("input").cloned().unwrap_or(Value::Null),
        };
        return Ok(Some(EngineTask { token, kind }));
    }

    Err(EngineError::Poll("task without workflow or activity".into()))
}

#[async_trait]
impl TaskTransport for EngineClient {
    async fn poll_task(&self, task_queue: &str) -> Result<Option<EngineTask>, EngineError> {
        let (status, reply) = self
            .send_json(
                self.client
                    .post(self.url(&format!("task-queues/{task_queue}/poll")))
                    .json(&json!({ "waitSeconds": POLL_WAIT.as_secs() })),
            )
            .await?;
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::ensure_ok(status, &reply)?;
        parse_task(&reply)
    }

    async fn complete_task(&self, token: &str, result: Value) -> Result<(), EngineError> {
        let (status, reply) = self
            .send_json(
                self.client
                    .post(self.url(&format!("tasks/{token}/complete")))
                    .json(&json!({ "result": result })),
            )
            .await?;
        Self::ensure_ok(status, &reply)
    }

    async fn fail_task(
        &self,
        token: &str,
        message: &str,
        non_retryable: bool,
    ) -> Result<(), EngineError> {
        let (status, reply) = self
            .send_json(
                self.client
                    .post(self.url(&format!("tasks/{token}/fail")))
                    .json(&json!({
                        "failure": { "message": message, "nonRetryable": non_retryable },
                    })),
            )
            .await?;
        Self::ensure_ok(status, &reply)
    }

    async fn dispatch_activity(
        &self,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> Result<String, EngineError> {
        let (status, reply) = self
            .send_json(self.client.post(self.url("activities")).json(&json!({
                "activityType": { "name": activity_type },
                "taskQueue": { "name": options.task_queue },
                "input": input,
                "startToCloseTimeout": format_duration(options.start_to_close_timeout),
                "retryPolicy": {
                    "maximumAttempts": options.retry.maximum_attempts,
                    "maximumInterval": format_duration(options.retry.maximum_interval),
                },
            })))
            .await?;
        Self::ensure_ok(status, &reply)?;
        reply
            .get("activityId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| EngineError::Transport("dispatch reply without activityId".into()))
    }

    async fn await_activity(&self, activity_id: &str) -> Result<Value, EngineError> {
        loop {
            let (status, reply) = self
                .send_json(
                    self.client
                        .get(self.url(&format!("activities/{activity_id}/result")))
                        .query(&[("waitSeconds", RESULT_WAIT.as_secs().to_string())]),
                )
                .await?;
            if status == reqwest::StatusCode::NO_CONTENT {
                continue;
            }
            Self::ensure_ok(status, &reply)?;

            match reply.get("status").and_then(|v| v.as_str()) {
                Some("completed") => {
                    return Ok(reply.get("result").cloned().unwrap_or(Value::Null))
                }
                Some("failed") => {
                    return Err(EngineError::ActivityFailed {
                        message: reply
                            .pointer("/failure/message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("activity failed")
                            .to_string(),
                        non_retryable: reply
                            .pointer("/failure/nonRetryable")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    })
                }
                // still running; keep waiting
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_variants() {
        let workflow = json!({
            "taskToken": "tok-1",
            "workflow": {
                "workflowType": { "name": "OrchestratorWorkflow" },
                "workflowId": "wf-1",
                "startedTime": "2026-01-10T12:00:00Z",
                "input": [ { "nonce": 0 } ],
            },
        });
        let task = parse_task(&workflow).expect("parse").expect("task");
        assert_eq!(task.token, "tok-1");
        match task.kind {
            TaskKind::Workflow {
                workflow_type,
                workflow_id,
                input,
                ..
            } => {
                assert_eq!(workflow_type, "OrchestratorWorkflow");
                assert_eq!(workflow_id, "wf-1");
                assert_eq!(input, json!({ "nonce": 0 }));
            }
            other => panic!("unexpected task kind: {other:?}"),
        }

        let activity = json!({
            "taskToken": "tok-2",
            "activity": { "activityType": { "name": "ExecutionHandler" }, "input": 7 },
        });
        let task = parse_task(&activity).expect("parse").expect("task");
        match task.kind {
            TaskKind::Activity {
                activity_type,
                input,
            } => {
                assert_eq!(activity_type, "ExecutionHandler");
                assert_eq!(input, json!(7));
            }
            other => panic!("unexpected task kind: {other:?}"),
        }
    }

    #[test]
    fn test_parse_task_empty_poll() {
        assert!(parse_task(&Value::Null).expect("parse").is_none());
        assert!(parse_task(&json!({ "taskToken": "" }))
            .expect("parse")
            .is_none());
        assert!(parse_task(&json!({ "taskToken": "tok", "other": 1 })).is_err());
    }

    #[test]
    fn test_parse_description_shapes() {
        let body = json!({
            "info": {
                "numActions": 3,
                "recentActions": [
                    {
                        "startWorkflowResult": { "workflowId": "wf-a" },
                        "actualTime": "2026-01-10T11:00:00Z",
                    },
                    {
                        "startWorkflowResult": { "workflowId": "wf-b" },
                        "actualTime": "2026-01-10T12:00:00Z",
                    },
                ],
                "runningWorkflows": [ { "workflowId": "wf-b" } ],
            },
        });
        let description = parse_description(&body);
        assert_eq!(description.num_actions, 3);
        assert_eq!(description.recent_actions.len(), 2);
        assert_eq!(description.recent_actions[1].workflow_id, "wf-b");
        assert_eq!(description.running_workflows.len(), 1);

        let empty = parse_description(&json!({}));
        assert_eq!(empty.num_actions, 0);
        assert!(empty.recent_actions.is_empty());
    }
}
