use crate::console::ConsoleClient;
use crate::engine::{EngineClient, Worker};
use crate::executor::ConsoleExecutor;
use crate::logs::SqliteLogStore;
use crate::oracle::PriceApiOracle;
use crate::rpc::Rpc;
use crate::secrets::KeyManager;
use crate::strategy::morpho::{MorphoConfig, RebalancingStrategy};
use crate::vaults::{VaultIndexClient, VaultReader};
use crate::workflows::EXECUTION_HANDLER_ACTIVITY;
use std::path::Path;
use std::sync::Arc;

const KEY_MANAGER_SERVICE: &str = "console-kernel";

pub async fn run(id: &str) -> anyhow::Result<()> {
    let (store, config) = super::load_config().await?;

    let engine = Arc::new(EngineClient::new(
        &config.temporal_host,
        &config.temporal_namespace,
    )?);
    engine.register_namespace().await?;

    let executors = config.executor_repo()?;
    let executor_config = executors
        .by_id(id)
        .map_err(|err| anyhow::anyhow!("failed to fetch strategy config for `{id}`: {err}"))?
        .clone();
    let strategy_config = MorphoConfig::parse(&executor_config.strategy_config)?;

    let rpc = Rpc::new(&config.chain_rpc_urls)?;
    let chain_client = rpc.client(executor_config.chain_id)?;
    let console = ConsoleClient::new(&config.console_base_url)?;

    let submitter = Arc::new(
        ConsoleExecutor::new(
            executor_config.executor_address()?,
            executor_config.chain_id,
            chain_client.clone(),
            Arc::new(KeyManager::new(store.clone(), KEY_MANAGER_SERVICE)),
            console,
            executor_config.signer_address(),
            config.executor_plugin_address,
        )
        .await?,
    );

    let strategy = RebalancingStrategy::new(
        Arc::new(VaultIndexClient::new(&strategy_config.base_url)?),
        Arc::new(VaultReader::new(chain_client)),
        submitter,
        Arc::new(SqliteLogStore::open(Path::new(&config.execution_logs_path))?),
        Arc::new(PriceApiOracle::new()?),
        strategy_config,
    )?;

    let mut worker = Worker::new(engine, &executor_config.task_queue);
    worker.register_activity(EXECUTION_HANDLER_ACTIVITY, Arc::new(strategy));

    worker.run().await
}
