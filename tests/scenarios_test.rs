// tests/scenarios_test.rs

//! Cross-module scenario tests: each test wires a real `InMemoryDcs` to one
//! or more `ControlLoop`s and drives full ticks, the way the core-module unit
//! tests exercise a single collaborator in isolation but these exercise the
//! whole C1/C2/C6 chain together, mirroring the unit-test/integration-test
//! split the teacher keeps between `#[cfg(test)]` modules and `tests/`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keepered::core::dcs::memory::InMemoryDcs;
use keepered::core::dcs::Dcs;
use keepered::core::executor::AsyncExecutor;
use keepered::core::failsafe::FailsafeClient;
use keepered::core::ha::{ControlLoop, ControlLoopConfig, Observer, TickOutcome};
use keepered::core::process::runner::ScriptedCommandRunner;
use keepered::core::process::{DbRole, DbState, ProcessManager};
use keepered::core::snapshot::{
    DynamicConfig, Member, MemberHealth, MemberRole, SynchronousMode,
};
use keepered::core::tags::Tags;

struct FixedObserver {
    flush_lsn: AtomicU64,
    observed_parameters: parking_lot::Mutex<std::collections::BTreeMap<String, String>>,
}

impl FixedObserver {
    fn new(flush_lsn: u64) -> Self {
        Self {
            flush_lsn: AtomicU64::new(flush_lsn),
            observed_parameters: parking_lot::Mutex::new(std::collections::BTreeMap::new()),
        }
    }
}

#[async_trait]
impl Observer for FixedObserver {
    async fn observed_parameters(&self) -> std::collections::BTreeMap<String, String> {
        self.observed_parameters.lock().clone()
    }
    async fn flush_lsn(&self) -> u64 {
        self.flush_lsn.load(Ordering::SeqCst)
    }
    async fn server_version(&self) -> u32 {
        1400
    }
}

struct AlwaysConfirmFailsafe;

#[async_trait]
impl FailsafeClient for AlwaysConfirmFailsafe {
    async fn confirm_leader(&self, _member_api_url: &str, _leader_name: &str) -> bool {
        true
    }
}

fn member(name: &str, xlog_location: u64, tags: Tags) -> Member {
    Member {
        name: name.to_string(),
        api_url: format!("http://{name}"),
        conn_url: format!("postgres://{name}"),
        role: MemberRole::Replica,
        state: MemberHealth::Running,
        tags,
        xlog_location,
        timeline: 1,
        version: None,
        session: name.to_string(),
    }
}

fn control_loop(
    name: &str,
    dcs: Arc<InMemoryDcs>,
    observed_flush_lsn: u64,
    maximum_lag_on_failover: u64,
) -> ControlLoop<ScriptedCommandRunner, FixedObserver> {
    control_loop_with_observer(
        name,
        dcs,
        Arc::new(FixedObserver::new(observed_flush_lsn)),
        maximum_lag_on_failover,
    )
}

fn control_loop_with_observer(
    name: &str,
    dcs: Arc<InMemoryDcs>,
    observer: Arc<FixedObserver>,
    maximum_lag_on_failover: u64,
) -> ControlLoop<ScriptedCommandRunner, FixedObserver> {
    let process = Arc::new(ProcessManager::new(
        ScriptedCommandRunner::default(),
        PathBuf::from("/tmp/data"),
        PathBuf::from("/usr/bin"),
    ));
    // `Running` so `tick()` refreshes `flush_lsn` from the observer instead of
    // leaving it at its zeroed default.
    process.local.lock().state = DbState::Running;
    let executor = AsyncExecutor::spawn(|_a, _c, _t| async { true });
    ControlLoop::new(
        ControlLoopConfig {
            name: name.to_string(),
            ttl: Duration::from_secs(30),
            loop_wait: Duration::from_secs(10),
            retry_timeout: Duration::from_secs(5),
            maximum_lag_on_failover,
            paused: false,
        },
        Tags::default(),
        dcs,
        process,
        observer,
        executor,
        Arc::new(AlwaysConfirmFailsafe),
    )
}

/// S1: unlocked cluster, two equal replicas — exactly one wins the CAS race,
/// the loser observes the key held and follows it on the next tick.
#[tokio::test]
async fn s1_two_equal_replicas_exactly_one_acquires_the_lease() {
    let dcs = Arc::new(InMemoryDcs::new());
    dcs.seed_config(DynamicConfig {
        synchronous_mode: SynchronousMode::Off,
        ..Default::default()
    });
    dcs.touch_member(member("a", 100, Tags::default()), Duration::from_secs(30))
        .await
        .unwrap();
    dcs.touch_member(member("b", 100, Tags::default()), Duration::from_secs(30))
        .await
        .unwrap();

    let loop_a = control_loop("a", dcs.clone(), 100, 100);
    let loop_b = control_loop("b", dcs.clone(), 100, 100);
    loop_a.process.local.lock().role = DbRole::Replica;
    loop_b.process.local.lock().role = DbRole::Replica;

    let (outcome_a, outcome_b) = tokio::join!(loop_a.tick(), loop_b.tick());
    let outcomes = [outcome_a.unwrap(), outcome_b.unwrap()];

    let acquired = outcomes
        .iter()
        .filter(|o| matches!(o, TickOutcome::AcquiredLeadership))
        .count();
    assert_eq!(acquired, 1, "exactly one of the two equal replicas must win the race");
}

/// S2: leader dies; a replica close enough to the last known primary LSN may
/// acquire, one that has fallen behind past `maximum_lag_on_failover` must not.
#[tokio::test]
async fn s2_lagging_replica_refuses_acquisition_under_the_lag_guard() {
    let dcs = Arc::new(InMemoryDcs::new());
    dcs.seed_config(DynamicConfig {
        synchronous_mode: SynchronousMode::Off,
        ..Default::default()
    });
    // No active lease: the old leader L has already expired out.
    dcs.touch_member(member("a", 1000, Tags::default()), Duration::from_secs(30))
        .await
        .unwrap();
    dcs.touch_member(member("b", 500, Tags::default()), Duration::from_secs(30))
        .await
        .unwrap();

    let loop_a = control_loop("a", dcs.clone(), 1000, 100);
    let loop_b = control_loop("b", dcs.clone(), 500, 100);
    loop_a.process.local.lock().role = DbRole::Replica;
    loop_b.process.local.lock().role = DbRole::Replica;

    // B's own progress (500) trails A's advertised position (1000) by more
    // than the configured guard, so B must refuse even if it ticks first.
    let outcome_b = loop_b.tick().await.unwrap();
    assert!(
        !matches!(outcome_b, TickOutcome::AcquiredLeadership),
        "lagging replica must not acquire leadership: {outcome_b:?}"
    );

    let outcome_a = loop_a.tick().await.unwrap();
    assert_eq!(outcome_a, TickOutcome::AcquiredLeadership);
}

/// S5: an operator changes a GUC directly against the database outside this
/// agent's own writes; the reconciler must surface it as a pending restart,
/// not silently ignore it.
#[tokio::test]
async fn s5_external_parameter_change_is_flagged_pending_restart() {
    let dcs = Arc::new(InMemoryDcs::new());
    let mut config = DynamicConfig::default();
    config
        .parameters
        .insert("shared_buffers".to_string(), "131072".to_string());
    dcs.seed_config(config);
    dcs.attempt_to_acquire_leader("a", Duration::from_secs(30))
        .await
        .unwrap();

    let observer = Arc::new(FixedObserver::new(100));
    // The live value an operator changed directly, differing from desired.
    observer
        .observed_parameters
        .lock()
        .insert("shared_buffers".to_string(), "65536".to_string());

    let loop_a = control_loop_with_observer("a", dcs.clone(), observer, 100);
    loop_a.process.local.lock().role = DbRole::Primary;

    let outcome = loop_a.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::RemainedLeader);
    let pending = loop_a.process.pending_restart.lock();
    assert!(!pending.is_empty());
    let (old, new) = pending
        .entries()
        .find(|(name, _)| *name == "shared_buffers")
        .map(|(_, change)| change.clone())
        .expect("shared_buffers should be pending restart");
    assert_eq!(old, "65536");
    assert_eq!(new, "131072");
}

/// S6: we hold the leader key per a stale local view, but a CAS refresh shows
/// someone else already holds it — split brain must be resolved by
/// demoting immediately rather than continuing to serve writes.
#[tokio::test]
async fn s6_stale_leader_view_triggers_immediate_demotion() {
    let dcs = Arc::new(InMemoryDcs::new());
    dcs.attempt_to_acquire_leader("rival", Duration::from_secs(30))
        .await
        .unwrap();

    let loop_a = control_loop("a", dcs.clone(), 100, 100);
    loop_a.process.local.lock().role = DbRole::Primary;

    let outcome = loop_a.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::DemotedSplitBrain);
    assert_eq!(loop_a.process.local.lock().role, DbRole::Demoted);
}
