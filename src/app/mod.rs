//! Process entry points for the three deployables: the reconciling
//! scheduler daemon, the base workflow worker, and the strategy worker.

pub mod base_worker;
pub mod morpho_worker;
pub mod scheduler;

use crate::config::AppConfig;
use crate::secrets::SecretStore;

/// Shared bootstrap: connect the secret store, start token renewal, load
/// and validate the frozen config.
pub(crate) async fn load_config() -> anyhow::Result<(SecretStore, AppConfig)> {
    let store = SecretStore::connect().await?;
    store.run_lifetime_watcher();

    let raw = store.read_config().await?;
    let config = AppConfig::from_source(&raw)?;
    Ok((store, config))
}
