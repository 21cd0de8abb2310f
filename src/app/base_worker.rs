use crate::engine::{EngineClient, Worker, BASE_TASK_QUEUE};
use crate::workflows::{
    ContextActivity, Orchestrator, GET_EXECUTION_CONTEXT_ACTIVITY, ORCHESTRATOR_WORKFLOW,
};
use std::sync::Arc;

pub async fn run() -> anyhow::Result<()> {
    let (_store, config) = super::load_config().await?;

    let engine = Arc::new(EngineClient::new(
        &config.temporal_host,
        &config.temporal_namespace,
    )?);
    engine.register_namespace().await?;

    let mut worker = Worker::new(engine.clone(), BASE_TASK_QUEUE);
    worker.register_workflow(
        ORCHESTRATOR_WORKFLOW,
        Arc::new(Orchestrator::new(config.executor_repo()?)),
    );
    worker.register_activity(
        GET_EXECUTION_CONTEXT_ACTIVITY,
        Arc::new(ContextActivity::new(engine.clone())),
    );

    worker.run().await
}
