//! Reconciling scheduler.
//!
//! Each tick makes the set of durable schedules equal to the set of active
//! subscriptions, per chain: fetch the registry, query existing schedules,
//! create what is missing, terminate what no longer belongs. The operation
//! is idempotent; any fetch error aborts the cycle and the next tick retries
//! from scratch.

use crate::config::ExecutorConfigRepo;
use crate::console::{ClientSubscription, ExecutorMetadata, SubscriptionSource};
use crate::engine::{OverlapPolicy, ScheduleOptions, ScheduleStore, BASE_TASK_QUEUE};
use crate::schedule::{
    CustomIntervalOptions, ExecuteWorkflowParams, OrchestratorParams, Schedule, ScheduleRepo,
    ScheduledWorkflowConfig, SEARCH_ATTRIBUTES, SEARCH_ATTR_CHAIN_ID, SEARCH_ATTR_EXECUTOR_ADDRESS,
    SEARCH_ATTR_EXECUTOR_ID, SEARCH_ATTR_SUB_ACCOUNT_ADDRESS,
};
use crate::utils::parse_duration_or_seconds;
use crate::workflows::ORCHESTRATOR_WORKFLOW;
use alloy::primitives::Address;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    console: Arc<dyn SubscriptionSource>,
    executors: ExecutorConfigRepo,
    schedules: ScheduleRepo,
}

impl Scheduler {
    /// Registers the typed search attributes before the first sync; an
    /// engine-side "already exists" is not an error.
    pub async fn new(
        store: Arc<dyn ScheduleStore>,
        console: Arc<dyn SubscriptionSource>,
        executors: ExecutorConfigRepo,
        schedules: ScheduleRepo,
    ) -> anyhow::Result<Self> {
        store.register_search_attributes(&SEARCH_ATTRIBUTES).await?;
        Ok(Self {
            store,
            console,
            executors,
            schedules,
        })
    }

    pub async fn sync(&self) -> anyhow::Result<()> {
        let (subscriptions, executor_metadata) = self.fetch_accounts_and_metadata().await?;
        let accounts_by_chain = group_accounts_by_chain(subscriptions);

        for (chain_id, accounts) in accounts_by_chain {
            self.sync_chain(chain_id, &accounts, &executor_metadata)
                .await?;
        }
        Ok(())
    }

    async fn fetch_accounts_and_metadata(
        &self,
    ) -> anyhow::Result<(Vec<ClientSubscription>, HashMap<String, ExecutorMetadata>)> {
        let mut accounts = Vec::new();
        let mut executor_metadata = HashMap::new();

        for executor in self.executors.list() {
            let address = executor.executor_address()?;
            let metadata = self
                .console
                .executor_by_address_and_chain_id(address, executor.chain_id)
                .await?;
            let subscriptions = self.console.subscriptions(&metadata.id).await?;
            executor_metadata.insert(metadata.id.clone(), metadata);
            accounts.extend(subscriptions);
        }

        Ok((accounts, executor_metadata))
    }

    async fn sync_chain(
        &self,
        chain_id: u64,
        accounts: &[ClientSubscription],
        executor_metadata: &HashMap<String, ExecutorMetadata>,
    ) -> anyhow::Result<()> {
        tracing::info!(chain_id, accounts = accounts.len(), "syncing chain");

        let sub_accounts: Vec<Address> =
            accounts.iter().filter_map(|acc| acc.sub_account()).collect();
        let existing = self
            .schedules
            .by_sub_accounts_and_chain_id(&sub_accounts, chain_id)
            .await?;

        let existing_set: HashSet<Address> = existing
            .iter()
            .map(|schedule| {
                tracing::info!(
                    schedule_id = %schedule.schedule_id,
                    subaccount = %schedule.config.params.sub_account_address.to_checksum(None),
                    "existing schedule"
                );
                schedule.config.params.sub_account_address
            })
            .collect();

        self.create_new_schedules(accounts, executor_metadata, &existing_set, chain_id)
            .await?;
        self.terminate_cancelled_schedules(&existing, accounts).await
    }

    async fn create_new_schedules(
        &self,
        accounts: &[ClientSubscription],
        executor_metadata: &HashMap<String, ExecutorMetadata>,
        existing: &HashSet<Address>,
        chain_id: u64,
    ) -> anyhow::Result<()> {
        for account in accounts {
            let Some(sub_account) = account.sub_account() else {
                continue;
            };
            if existing.contains(&sub_account) || !account.is_active() {
                continue;
            }

            let metadata = executor_metadata.get(&account.registry_id).ok_or_else(|| {
                anyhow::anyhow!("no executor metadata for registry {}", account.registry_id)
            })?;
            let config = self.workflow_config(account, metadata, chain_id)?;

            tracing::info!(
                schedule_id = %config.params.id(),
                subaccount = %account.sub_account_address,
                "creating new schedule"
            );
            self.run(config).await?;
        }
        Ok(())
    }

    fn workflow_config(
        &self,
        account: &ClientSubscription,
        metadata: &ExecutorMetadata,
        chain_id: u64,
    ) -> anyhow::Result<ExecuteWorkflowParams> {
        let executor_address = Address::from_str(metadata.executor.trim())
            .map_err(|err| anyhow::anyhow!("invalid executor address `{}`: {err}", metadata.executor))?;
        let executor_config = self.executors.config(executor_address)?;
        let mut every = executor_config.default_every()?;

        // Cadence override: the subscription metadata may carry a custom
        // `Every`; a value that parses neither way keeps the default.
        if let Ok(custom) =
            serde_json::from_value::<CustomIntervalOptions>(account.metadata.clone())
        {
            if !custom.every.is_empty() {
                if let Some(duration) = parse_duration_or_seconds(&custom.every) {
                    every = duration;
                }
            }
        }

        Ok(ExecuteWorkflowParams {
            nonce: 0,
            params: OrchestratorParams {
                executor_address,
                sub_account_address: account.sub_account().ok_or_else(|| {
                    anyhow::anyhow!("invalid sub-account `{}`", account.sub_account_address)
                })?,
                executor_id: account.registry_id.clone(),
                chain_id,
                subscription: account.clone(),
            },
            schedule: Some(ScheduledWorkflowConfig {
                every,
                id: String::new(),
            }),
        })
    }

    /// Creates the durable schedule for one subscription. The id is the
    /// deterministic fingerprint of the orchestrator params; the first fire
    /// happens immediately.
    pub async fn run(&self, mut config: ExecuteWorkflowParams) -> anyhow::Result<String> {
        let schedule_id = config.params.id();
        let every = match &mut config.schedule {
            Some(schedule) => {
                schedule.id = schedule_id.clone();
                schedule.every
            }
            None => anyhow::bail!("workflow config without schedule"),
        };

        let search_attributes = BTreeMap::from([
            (
                SEARCH_ATTR_SUB_ACCOUNT_ADDRESS.to_string(),
                json!(config.params.sub_account_address.to_checksum(None)),
            ),
            (
                SEARCH_ATTR_EXECUTOR_ADDRESS.to_string(),
                json!(config.params.executor_address.to_checksum(None)),
            ),
            (SEARCH_ATTR_CHAIN_ID.to_string(), json!(config.params.chain_id)),
            (
                SEARCH_ATTR_EXECUTOR_ID.to_string(),
                json!(config.params.executor_id),
            ),
        ]);

        let memo = BTreeMap::from([
            ("nonce".to_string(), json!(config.nonce)),
            ("params".to_string(), serde_json::to_value(&config.params)?),
            (
                "schedule".to_string(),
                serde_json::to_value(&config.schedule)?,
            ),
        ]);

        let options = ScheduleOptions {
            id: schedule_id,
            every,
            task_queue: BASE_TASK_QUEUE.to_string(),
            workflow_type: ORCHESTRATOR_WORKFLOW.to_string(),
            args: serde_json::to_value(&config)?,
            memo,
            search_attributes,
            note: config.params.subscription.metadata.to_string(),
            overlap: OverlapPolicy::Skip,
            trigger_immediately: true,
            pause_on_failure: false,
        };

        Ok(self.store.create_schedule(&options).await?)
    }

    /// Terminate every schedule whose sub-account is absent from the current
    /// subscription set or whose subscription is cancelled.
    async fn terminate_cancelled_schedules(
        &self,
        existing: &[Schedule],
        accounts: &[ClientSubscription],
    ) -> anyhow::Result<()> {
        let by_sub_account: HashMap<Address, &ClientSubscription> = accounts
            .iter()
            .filter_map(|acc| acc.sub_account().map(|addr| (addr, acc)))
            .collect();

        for schedule in existing {
            let sub_account = schedule.config.params.sub_account_address;
            let stale = match by_sub_account.get(&sub_account) {
                None => true,
                Some(subscription) => subscription.is_cancelled(),
            };
            if !stale {
                continue;
            }

            tracing::info!(
                schedule_id = %schedule.schedule_id,
                subaccount = %sub_account.to_checksum(None),
                "terminating schedule"
            );
            self.store.delete_schedule(&schedule.schedule_id).await?;
        }
        Ok(())
    }
}

fn group_accounts_by_chain(
    accounts: Vec<ClientSubscription>,
) -> BTreeMap<u64, Vec<ClientSubscription>> {
    let mut by_chain: BTreeMap<u64, Vec<ClientSubscription>> = BTreeMap::new();
    for account in accounts {
        by_chain.entry(account.chain_id).or_default().push(account);
    }
    by_chain
}
