//! Reconciliation scenarios for the sync scheduler, run against in-process
//! fakes of the registry and the schedule store.

use alloy::primitives::{address, Address};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use vault_pilot::config::{ExecutorConfig, ExecutorConfigRepo};
use vault_pilot::console::{ClientSubscription, ExecutorMetadata, SubscriptionSource};
use vault_pilot::engine::{
    memo, OverlapPolicy, ScheduleDescription, ScheduleListEntry, ScheduleOptions, ScheduleStore,
    SearchAttributeKind,
};
use vault_pilot::error::EngineError;
use vault_pilot::schedule::{OrchestratorParams, ScheduleRepo};
use vault_pilot::scheduler::Scheduler;

const EXECUTOR: Address = address!("cF77a3Ba9A5CA399B7c97c74d54e5b1Beb874E43");
const SUB_A: Address = address!("A238Dd80C259a72e81d7e4664a9801593F98d1c5");
const SUB_B: Address = address!("BA12222222228d8Ba445958a75a0704d566BF2C8");
const CHAIN_ID: u64 = 8453;
const REGISTRY_ID: &str = "registry-1";

#[derive(Default)]
struct FakeScheduleStore {
    schedules: Mutex<BTreeMap<String, ScheduleOptions>>,
    created: Mutex<u32>,
    terminated: Mutex<u32>,
}

impl FakeScheduleStore {
    fn created(&self) -> u32 {
        *self.created.lock().unwrap()
    }

    fn terminated(&self) -> u32 {
        *self.terminated.lock().unwrap()
    }

    fn schedule_ids(&self) -> Vec<String> {
        self.schedules.lock().unwrap().keys().cloned().collect()
    }

    fn options(&self, id: &str) -> Option<ScheduleOptions> {
        self.schedules.lock().unwrap().get(id).cloned()
    }

    fn seed(&self, options: ScheduleOptions) {
        self.schedules
            .lock()
            .unwrap()
            .insert(options.id.clone(), options);
    }
}

#[async_trait]
impl ScheduleStore for FakeScheduleStore {
    async fn register_search_attributes(
        &self,
        _attributes: &[(&str, SearchAttributeKind)],
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_schedule(&self, options: &ScheduleOptions) -> Result<String, EngineError> {
        *self.created.lock().unwrap() += 1;
        self.schedules
            .lock()
            .unwrap()
            .insert(options.id.clone(), options.clone());
        Ok(options.id.clone())
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
        let removed = self.schedules.lock().unwrap().remove(schedule_id);
        if removed.is_none() {
            return Err(EngineError::ScheduleNotFound(schedule_id.to_string()));
        }
        *self.terminated.lock().unwrap() += 1;
        Ok(())
    }

    async fn list_schedules(
        &self,
        _query: &str,
        _page_size: u32,
        _next_page_token: &str,
    ) -> Result<(Vec<ScheduleListEntry>, String), EngineError> {
        let entries = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .map(|options| {
                Ok(ScheduleListEntry {
                    schedule_id: options.id.clone(),
                    memo: Some(memo::encode_envelope(&options.memo)?),
                    start_at: None,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Ok((entries, String::new()))
    }

    async fn describe_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<ScheduleDescription, EngineError> {
        if self.schedules.lock().unwrap().contains_key(schedule_id) {
            Ok(ScheduleDescription::default())
        } else {
            Err(EngineError::ScheduleNotFound(schedule_id.to_string()))
        }
    }
}

#[derive(Default)]
struct FakeRegistry {
    subscriptions: Mutex<Vec<ClientSubscription>>,
}

impl FakeRegistry {
    fn set(&self, subscriptions: Vec<ClientSubscription>) {
        *self.subscriptions.lock().unwrap() = subscriptions;
    }
}

#[async_trait]
impl SubscriptionSource for FakeRegistry {
    async fn executor_by_address_and_chain_id(
        &self,
        address: Address,
        chain_id: u64,
    ) -> anyhow::Result<ExecutorMetadata> {
        Ok(ExecutorMetadata {
            id: REGISTRY_ID.into(),
            executor: address.to_checksum(None),
            chain_id,
            status: 0,
        })
    }

    async fn subscriptions(&self, _registry_id: &str) -> anyhow::Result<Vec<ClientSubscription>> {
        Ok(self.subscriptions.lock().unwrap().clone())
    }
}

fn subscription(sub_account: Address, status: i32, metadata: serde_json::Value) -> ClientSubscription {
    ClientSubscription {
        id: format!("sub-{sub_account:#x}"),
        sub_account_address: sub_account.to_checksum(None),
        chain_id: CHAIN_ID,
        registry_id: REGISTRY_ID.into(),
        status,
        metadata,
    }
}

fn executor_repo() -> ExecutorConfigRepo {
    ExecutorConfigRepo::new(&[ExecutorConfig {
        activity_timeout: "5m".into(),
        task_queue: "morpho-task-queue".into(),
        retry_attempts: 3,
        maximum_retry_interval: "1m".into(),
        chain_id: CHAIN_ID,
        address: EXECUTOR.to_checksum(None),
        signer: String::new(),
        every: "10m".into(),
        strategy_config: serde_json::Value::Null,
        id: "morpho-rebalancer-base".into(),
    }])
    .expect("executor repo")
}

struct Fixture {
    scheduler: Scheduler,
    store: Arc<FakeScheduleStore>,
    registry: Arc<FakeRegistry>,
}

async fn fixture() -> Fixture {
    let store = Arc::new(FakeScheduleStore::default());
    let registry = Arc::new(FakeRegistry::default());
    let scheduler = Scheduler::new(
        store.clone(),
        registry.clone(),
        executor_repo(),
        ScheduleRepo::new(store.clone()),
    )
    .await
    .expect("scheduler");
    Fixture {
        scheduler,
        store,
        registry,
    }
}

fn expected_schedule_id(sub_account: Address) -> String {
    OrchestratorParams {
        executor_address: EXECUTOR,
        sub_account_address: sub_account,
        executor_id: REGISTRY_ID.into(),
        chain_id: CHAIN_ID,
        subscription: ClientSubscription::default(),
    }
    .id()
}

#[tokio::test]
async fn creates_schedule_for_active_subscription() {
    let f = fixture().await;
    f.registry.set(vec![subscription(SUB_A, 2, json!({}))]);

    f.scheduler.sync().await.expect("sync");

    assert_eq!(f.store.created(), 1);
    assert_eq!(f.store.terminated(), 0);
    let ids = f.store.schedule_ids();
    assert_eq!(ids, vec![expected_schedule_id(SUB_A)]);

    let options = f.store.options(&ids[0]).expect("options");
    assert!(options.trigger_immediately);
    assert!(!options.pause_on_failure);
    assert_eq!(options.overlap, OverlapPolicy::Skip);
    assert_eq!(options.task_queue, "base-task-queue");
    assert_eq!(options.workflow_type, "OrchestratorWorkflow");
    assert_eq!(options.every, std::time::Duration::from_secs(600));
    assert_eq!(
        options.search_attributes["subAccountAddress"],
        json!(SUB_A.to_checksum(None))
    );
    assert_eq!(options.search_attributes["chainID"], json!(CHAIN_ID));
}

#[tokio::test]
async fn sync_is_idempotent() {
    let f = fixture().await;
    f.registry.set(vec![
        subscription(SUB_A, 2, json!({})),
        subscription(SUB_B, 2, json!({})),
    ]);

    f.scheduler.sync().await.expect("first sync");
    assert_eq!(f.store.created(), 2);

    f.scheduler.sync().await.expect("second sync");
    assert_eq!(f.store.created(), 2, "no creations on unchanged input");
    assert_eq!(f.store.terminated(), 0, "no terminations on unchanged input");
}

#[tokio::test]
async fn empty_subscription_list_is_a_noop() {
    let f = fixture().await;
    f.registry.set(Vec::new());

    f.scheduler.sync().await.expect("sync");
    assert_eq!(f.store.created(), 0);
    assert_eq!(f.store.terminated(), 0);
}

#[tokio::test]
async fn cancelled_subscription_terminates_its_schedule() {
    let f = fixture().await;

    // steady state: one active subscription with its schedule
    f.registry.set(vec![subscription(SUB_A, 2, json!({}))]);
    f.scheduler.sync().await.expect("seed sync");
    assert_eq!(f.store.created(), 1);

    // the subscription flips to cancelled
    f.registry.set(vec![subscription(SUB_A, 4, json!({}))]);
    f.scheduler.sync().await.expect("cleanup sync");

    assert_eq!(f.store.created(), 1, "no new creations");
    assert_eq!(f.store.terminated(), 1, "one termination");
    assert!(f.store.schedule_ids().is_empty());
}

#[tokio::test]
async fn removed_subscription_terminates_its_schedule() {
    let f = fixture().await;

    f.registry.set(vec![
        subscription(SUB_A, 2, json!({})),
        subscription(SUB_B, 2, json!({})),
    ]);
    f.scheduler.sync().await.expect("seed sync");
    assert_eq!(f.store.created(), 2);

    // SUB_B disappears from the registry entirely
    f.registry.set(vec![subscription(SUB_A, 2, json!({}))]);
    f.scheduler.sync().await.expect("cleanup sync");

    assert_eq!(f.store.terminated(), 1);
    assert_eq!(f.store.schedule_ids(), vec![expected_schedule_id(SUB_A)]);
}

#[tokio::test]
async fn reappearing_subscription_gets_a_fresh_schedule() {
    let f = fixture().await;

    f.registry.set(vec![subscription(SUB_A, 4, json!({}))]);
    // seed a live schedule for the cancelled subscription
    f.store.seed(ScheduleOptions {
        id: expected_schedule_id(SUB_A),
        every: std::time::Duration::from_secs(600),
        task_queue: "base-task-queue".into(),
        workflow_type: "OrchestratorWorkflow".into(),
        args: json!({}),
        memo: BTreeMap::from([(
            "params".to_string(),
            serde_json::to_value(OrchestratorParams {
                executor_address: EXECUTOR,
                sub_account_address: SUB_A,
                executor_id: REGISTRY_ID.into(),
                chain_id: CHAIN_ID,
                subscription: ClientSubscription::default(),
            })
            .unwrap(),
        )]),
        search_attributes: BTreeMap::new(),
        note: String::new(),
        overlap: OverlapPolicy::Skip,
        trigger_immediately: true,
        pause_on_failure: false,
    });

    f.scheduler.sync().await.expect("cleanup sync");
    assert_eq!(f.store.terminated(), 1);
    assert_eq!(f.store.created(), 0);

    // subscription comes back active on a later cycle: created anew
    f.registry.set(vec![subscription(SUB_A, 2, json!({}))]);
    f.scheduler.sync().await.expect("recreate sync");
    assert_eq!(f.store.created(), 1);
    assert_eq!(f.store.schedule_ids(), vec![expected_schedule_id(SUB_A)]);
}

#[tokio::test]
async fn custom_cadence_resolution() {
    // duration form
    let f = fixture().await;
    f.registry
        .set(vec![subscription(SUB_A, 2, json!({ "Every": "1m" }))]);
    f.scheduler.sync().await.expect("sync");
    let id = expected_schedule_id(SUB_A);
    assert_eq!(
        f.store.options(&id).expect("options").every,
        std::time::Duration::from_secs(60)
    );

    // integer-seconds fallback
    let f = fixture().await;
    f.registry
        .set(vec![subscription(SUB_A, 2, json!({ "Every": "90" }))]);
    f.scheduler.sync().await.expect("sync");
    assert_eq!(
        f.store.options(&id).expect("options").every,
        std::time::Duration::from_secs(90)
    );

    // unparseable keeps the executor default
    let f = fixture().await;
    f.registry
        .set(vec![subscription(SUB_A, 2, json!({ "Every": "soonish" }))]);
    f.scheduler.sync().await.expect("sync");
    assert_eq!(
        f.store.options(&id).expect("options").every,
        std::time::Duration::from_secs(600)
    );
}

#[tokio::test]
async fn memo_round_trips_through_the_repo() {
    let f = fixture().await;
    f.registry.set(vec![subscription(SUB_A, 2, json!({}))]);
    f.scheduler.sync().await.expect("sync");

    let repo = ScheduleRepo::new(f.store.clone());
    let schedules = repo
        .by_sub_accounts_and_chain_id(&[SUB_A], CHAIN_ID)
        .await
        .expect("list");
    assert_eq!(schedules.len(), 1);

    let schedule = &schedules[0];
    assert_eq!(schedule.config.params.sub_account_address, SUB_A);
    assert_eq!(schedule.config.params.executor_address, EXECUTOR);
    assert_eq!(schedule.config.params.chain_id, CHAIN_ID);
    let config = schedule.config.schedule.as_ref().expect("schedule config");
    assert_eq!(config.id, schedule.schedule_id);
    assert_eq!(config.every, std::time::Duration::from_secs(600));
}
