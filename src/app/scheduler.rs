use crate::console::ConsoleClient;
use crate::engine::EngineClient;
use crate::schedule::ScheduleRepo;
use crate::scheduler::Scheduler;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

pub async fn run() -> anyhow::Result<()> {
    let (_store, config) = super::load_config().await?;

    let engine = Arc::new(EngineClient::new(
        &config.temporal_host,
        &config.temporal_namespace,
    )?);
    engine.register_namespace().await?;

    let console = Arc::new(ConsoleClient::new(&config.console_base_url)?);
    let executors = config.executor_repo()?;
    let schedules = ScheduleRepo::new(engine.clone());
    let scheduler = Scheduler::new(engine.clone(), console, executors, schedules).await?;

    // First cycle runs right away; a failure here is a startup failure.
    scheduler.sync().await?;

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + config.sync_subscriptions_every,
        config.sync_subscriptions_every,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("scheduler interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(err) = scheduler.sync().await {
                    tracing::warn!(error = %err, "failed to call sync");
                }
            }
        }
    }
}
