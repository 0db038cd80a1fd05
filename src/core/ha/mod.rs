// src/core/ha/mod.rs

//! The HA control loop (C6): one tick — observe cluster, decide action, enact
//! it — plus the decision table and failover eligibility ordering from the
//! design. This ties together every other component (C1–C5, C7) the same way
//! `MasterMonitor::run_tick_loop` sequences `check_master_down` /
//! `check_replicas_down` / `reconfigure_stale_replicas` /
//! `check_failover_status` as one cooperative tick (`core/warden/worker.rs`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::dcs::Dcs;
use crate::core::errors::SupervisorError;
use crate::core::executor::{Action, AsyncExecutor};
use crate::core::failsafe::{self, FailsafeClient};
use crate::core::process::runner::CommandRunner;
use crate::core::process::{DbRole, DbState, ProcessManager, StopMode};
use crate::core::reconcile::{self, ReconcileResult};
use crate::core::retry::retry_with_backoff;
use crate::core::snapshot::{ClusterSnapshot, Member, MemberHealth, MemberRole, PromotionReason};
use crate::core::sync::{self, SyncCandidate, SyncStateRank};
use crate::core::tags::Tags;

/// Collaborator boundary for the database's own SQL surface (`pg_settings`,
/// `pg_current_wal_flush_lsn()`, `SELECT version()`, ...). The control loop
/// never speaks SQL itself — it only needs these three facts per tick.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observed_parameters(&self) -> BTreeMap<String, String>;
    async fn flush_lsn(&self) -> u64;
    async fn server_version(&self) -> u32;
}

/// What the control loop decided to do this tick. Exposed mainly for tests —
/// production callers only care about the side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    AcquiredLeadership,
    RemainedLeader,
    PromotionScheduled,
    DemotedSplitBrain,
    DemotedVoluntarily,
    FollowedLeader(String),
    AcquireLeaderFailed,
    NoOpPaused,
    NoOpDcsUnreachable,
    RemainedLeaderFailsafe,
    DemotedFailsafeLost,
}

pub struct ControlLoopConfig {
    pub name: String,
    pub ttl: Duration,
    pub loop_wait: Duration,
    pub retry_timeout: Duration,
    pub maximum_lag_on_failover: u64,
    pub paused: bool,
}

pub struct ControlLoop<R: CommandRunner, O: Observer> {
    pub config: ControlLoopConfig,
    pub tags: Tags,
    pub dcs: Arc<dyn Dcs>,
    pub process: Arc<ProcessManager<R>>,
    pub observer: Arc<O>,
    pub executor: Arc<AsyncExecutor>,
    pub failsafe: Arc<dyn FailsafeClient>,
    pub last_written_params: parking_lot::Mutex<BTreeMap<String, String>>,
    last_known_members: parking_lot::Mutex<Vec<Member>>,
    reload_requested: AtomicBool,
}

impl<R: CommandRunner, O: Observer> ControlLoop<R, O> {
    pub fn new(
        config: ControlLoopConfig,
        tags: Tags,
        dcs: Arc<dyn Dcs>,
        process: Arc<ProcessManager<R>>,
        observer: Arc<O>,
        executor: Arc<AsyncExecutor>,
        failsafe: Arc<dyn FailsafeClient>,
    ) -> Self {
        Self {
            config,
            tags,
            dcs,
            process,
            observer,
            executor,
            failsafe,
            last_written_params: parking_lot::Mutex::new(BTreeMap::new()),
            last_known_members: parking_lot::Mutex::new(Vec::new()),
            reload_requested: AtomicBool::new(false),
        }
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    /// One control-loop tick, following the nine steps of the decision design.
    pub async fn tick(&self) -> Result<TickOutcome, SupervisorError> {
        // Step 1: apply pending reload.
        if self.reload_requested.swap(false, Ordering::SeqCst) {
            info!("applying pending configuration reload");
        }
        self.process.check_liveness();

        if self.config.paused {
            self.touch_member().await?;
            return Ok(TickOutcome::NoOpPaused);
        }

        // Steps 2 & 3: probe + fetch the snapshot. A transient DCS failure here
        // is not escalated — we simply sit out this tick with an empty view.
        let snapshot = match retry_with_backoff(self.config.retry_timeout, || self.dcs.get_cluster()).await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "DCS unreachable this tick, retry budget exhausted");
                return self.handle_dcs_unreachable().await;
            }
        };
        *self.last_known_members.lock() = snapshot.members.clone();

        // Keep our own advertised replication position current regardless of
        // role, so both `touch_member` (below) and failover-lag comparisons
        // against peers reflect this tick's real progress, not a stale one.
        if self.process.local.lock().state == DbState::Running {
            let lsn = self.observer.flush_lsn().await;
            self.process.local.lock().flush_lsn = lsn;
        }

        // Step 4: bootstrap / create-replica handled by the caller driving
        // `ProcessManager` directly before the loop starts producing primary
        // decisions; here we only branch on already-known local role.
        let local_role = self.process.local.lock().role;
        let local_state = self.process.local.lock().state;
        let i_hold_leader_key = snapshot
            .leader
            .as_ref()
            .is_some_and(|l| l.name == self.config.name);

        let outcome = match (i_hold_leader_key, local_role, local_state) {
            (true, DbRole::Primary, _) => self.act_as_confirmed_leader(&snapshot).await?,
            (true, _, DbState::Stopped) => {
                self.dcs.release_leader(&self.config.name).await?;
                self.process.local.lock().role = DbRole::Demoted;
                TickOutcome::DemotedVoluntarily
            }
            (true, _, _) => {
                self.executor.schedule(Action::Promote {
                    reason: self.promotion_reason(&snapshot),
                });
                self.executor.run().await;
                TickOutcome::PromotionScheduled
            }
            (false, DbRole::Primary, _) if snapshot.leader.is_some() => {
                // Someone else holds the key while we still think we're primary:
                // split-brain candidate, demote immediately.
                self.demote_fast().await?;
                TickOutcome::DemotedSplitBrain
            }
            (false, DbRole::Replica, _) if snapshot.leader.is_some() => {
                let leader_name = snapshot.leader_name().unwrap().to_string();
                if let Some(leader_member) = snapshot.member(&leader_name) {
                    self.process
                        .follow(
                            &leader_member.conn_url,
                            self.observer.server_version().await,
                            None,
                        )
                        .await?;
                }
                TickOutcome::FollowedLeader(leader_name)
            }
            (false, DbRole::Primary, _) => {
                if self
                    .dcs
                    .attempt_to_acquire_leader(&self.config.name, self.config.ttl)
                    .await?
                {
                    TickOutcome::AcquiredLeadership
                } else {
                    self.demote_fast().await?;
                    TickOutcome::AcquireLeaderFailed
                }
            }
            (false, _, _) => {
                if self.is_eligible_for_failover(&snapshot) {
                    if self
                        .dcs
                        .attempt_to_acquire_leader(&self.config.name, self.config.ttl)
                        .await?
                    {
                        self.executor.schedule(Action::Promote {
                            reason: self.promotion_reason(&snapshot),
                        });
                        self.executor.run().await;
                        TickOutcome::AcquiredLeadership
                    } else {
                        TickOutcome::AcquireLeaderFailed
                    }
                } else if let Some(best) = self.best_failover_candidate(&snapshot) {
                    self.process
                        .follow(
                            &best.conn_url,
                            self.observer.server_version().await,
                            None,
                        )
                        .await?;
                    TickOutcome::FollowedLeader(best.name.clone())
                } else {
                    TickOutcome::NoOpDcsUnreachable
                }
            }
        };

        // Step 8: heartbeat our own member record regardless of the branch taken.
        self.touch_member().await?;

        Ok(outcome)
    }

    /// §4.6 failsafe mode: a DCS outage does not by itself demote a current
    /// leader. If every member this agent knew about as of its last
    /// successful snapshot still confirms it as leader over HTTP, it keeps
    /// serving writes; otherwise it demotes rather than risk split-brain
    /// against a peer that has since promoted itself.
    async fn handle_dcs_unreachable(&self) -> Result<TickOutcome, SupervisorError> {
        let local_role = self.process.local.lock().role;
        if local_role != DbRole::Primary {
            return Ok(TickOutcome::NoOpDcsUnreachable);
        }

        let peers: Vec<(String, String)> = self
            .last_known_members
            .lock()
            .iter()
            .filter(|m| m.name != self.config.name)
            .map(|m| (m.name.clone(), m.api_url.clone()))
            .collect();

        if failsafe::confirm_all(self.failsafe.as_ref(), &peers, &self.config.name).await {
            info!("DCS unreachable but failsafe confirmed by all known peers; retaining leadership");
            Ok(TickOutcome::RemainedLeaderFailsafe)
        } else {
            warn!("failsafe check failed, demoting to avoid split-brain");
            self.demote_fast().await?;
            Ok(TickOutcome::DemotedFailsafeLost)
        }
    }

    async fn act_as_confirmed_leader(
        &self,
        snapshot: &ClusterSnapshot,
    ) -> Result<TickOutcome, SupervisorError> {
        let lsn = self.process.local.lock().flush_lsn;
        let kept = self
            .dcs
            .update_leader(&self.config.name, self.config.ttl, lsn)
            .await?;
        if !kept {
            self.demote_fast().await?;
            return Ok(TickOutcome::DemotedSplitBrain);
        }

        if let Some(outcome) = self.honor_scheduled_failover(snapshot, lsn).await? {
            return Ok(outcome);
        }

        // Step 6: config reconciliation.
        let server_version = self.observer.server_version().await;
        let observed = self.observer.observed_parameters().await;
        let desired = snapshot.config.parameters.clone();
        let reconciled = self.reconcile_config(&desired, &observed, server_version);
        self.apply_reconciliation(&desired, &reconciled, server_version).await?;
        self.process.write_hba_and_ident(&snapshot.config.pg_hba, &snapshot.config.pg_ident)?;

        // Step 7: sync handler.
        self.run_sync_handler(snapshot, server_version).await?;

        Ok(TickOutcome::RemainedLeader)
    }

    /// Distinguishes an administrator-requested handoff (`/failover` names us
    /// as the candidate) from a spontaneous promote trigger, for the
    /// `/history` entry this promotion will append on commit (I4).
    fn promotion_reason(&self, snapshot: &ClusterSnapshot) -> PromotionReason {
        match snapshot.failover.as_ref().and_then(|f| f.candidate.as_deref()) {
            Some(candidate) if candidate == self.config.name => PromotionReason::ManualFailover,
            _ => PromotionReason::ReceivedPromoteTrigger,
        }
    }

    /// §4.6 "maybe honor scheduled failover": a pending `/failover` record
    /// naming us (or carrying no leader restriction) steps this leader down
    /// once its `scheduled_at` is due, provided the named candidate exists
    /// and is not lagging past `maximum_lag_on_failover` — the same guard a
    /// spontaneous acquisition obeys, so a requested failover can never hand
    /// leadership to a candidate that could not have won it on its own.
    async fn honor_scheduled_failover(
        &self,
        snapshot: &ClusterSnapshot,
        my_lsn: u64,
    ) -> Result<Option<TickOutcome>, SupervisorError> {
        let Some(record) = snapshot.failover.as_ref() else {
            return Ok(None);
        };
        if let Some(leader) = record.leader.as_deref()
            && leader != self.config.name
        {
            return Ok(None);
        }
        let Some(candidate_name) = record.candidate.as_deref() else {
            return Ok(None);
        };
        if candidate_name == self.config.name {
            return Ok(None);
        }
        if let Some(scheduled_at) = record.scheduled_at
            && scheduled_at > chrono::Utc::now()
        {
            return Ok(None);
        }
        let Some(candidate) = snapshot.member(candidate_name) else {
            warn!(candidate = candidate_name, "scheduled failover candidate is not a known member, ignoring");
            return Ok(None);
        };
        if my_lsn.saturating_sub(candidate.xlog_location) > self.config.maximum_lag_on_failover {
            warn!(
                candidate = candidate_name,
                "scheduled failover candidate is lagging past the guard, refusing to step down yet"
            );
            return Ok(None);
        }

        info!(candidate = candidate_name, "honoring scheduled failover, stepping down");
        self.dcs.set_failover_value(None, None).await?;
        self.demote_fast().await?;
        self.dcs.release_leader(&self.config.name).await?;
        Ok(Some(TickOutcome::DemotedVoluntarily))
    }

    fn reconcile_config(
        &self,
        desired: &BTreeMap<String, String>,
        observed: &BTreeMap<String, String>,
        server_version: u32,
    ) -> ReconcileResult {
        let last_written = self.last_written_params.lock().clone();
        reconcile::reconcile(desired, observed, &last_written, server_version)
    }

    async fn apply_reconciliation(
        &self,
        desired: &BTreeMap<String, String>,
        result: &ReconcileResult,
        _server_version: u32,
    ) -> Result<(), SupervisorError> {
        if !result.restart_list.is_empty() {
            let mut pending = self.process.pending_restart.lock();
            for (name, change) in &result.restart_list {
                pending.set(name, change.old.clone(), change.new.clone());
            }
        }
        if !result.reload_list.is_empty() {
            info!(count = result.reload_list.len(), "reloading configuration");
            let mut last_written = self.last_written_params.lock();
            for (name, change) in &result.reload_list {
                last_written.insert(name.clone(), change.new.clone());
            }
        }
        if !result.reload_list.is_empty() || !result.restart_list.is_empty() {
            // The managed file always carries the full desired set, not just
            // this tick's delta: parameters a restart is still pending for
            // belong in it too, so they take effect the moment that restart
            // happens rather than requiring a second reconciliation pass.
            let mut effective: BTreeMap<String, String> = desired.clone();
            for removed in &result.removed {
                effective.remove(removed);
            }
            self.process.write_parameters(&effective)?;
            self.process.reload().await?;
        }
        Ok(())
    }

    async fn run_sync_handler(
        &self,
        snapshot: &ClusterSnapshot,
        server_version: u32,
    ) -> Result<(), SupervisorError> {
        let candidates: Vec<SyncCandidate> = snapshot
            .members
            .iter()
            .filter(|m| m.name != self.config.name)
            .map(|m| SyncCandidate {
                name: m.name.clone(),
                sync_state: if m.tags.sync_priority > 0 {
                    SyncStateRank::Sync
                } else {
                    SyncStateRank::Async
                },
                flush_lag: snapshot.status.last_lsn.saturating_sub(m.xlog_location),
                nosync: m.tags.nosync,
                sync_priority: m.tags.sync_priority,
                replicatefrom: m.tags.replicatefrom.clone(),
                has_direct_streaming_equivalent: false,
            })
            .collect();

        let decision = sync::decide(
            snapshot.config.synchronous_mode,
            &candidates,
            snapshot.config.synchronous_node_count,
            &self.config.name,
        );

        let mut new_sync = snapshot.sync.clone();
        let shrinking = decision.names.len() < new_sync.sync_standby.len();
        new_sync.sync_standby = decision.names.iter().cloned().collect();
        new_sync.quorum = decision.quorum;
        new_sync.leader = Some(self.config.name.clone());

        // Ordering invariant (P3): shrink writes DCS first, grow writes DB config first.
        if shrinking {
            self.dcs
                .set_sync_state(&new_sync, Some(snapshot.sync.version))
                .await?;
            self.write_synchronous_standby_names(&decision, server_version);
        } else {
            self.write_synchronous_standby_names(&decision, server_version);
            self.dcs
                .set_sync_state(&new_sync, Some(snapshot.sync.version))
                .await?;
        }
        Ok(())
    }

    fn write_synchronous_standby_names(
        &self,
        decision: &sync::SyncDecision,
        server_version: u32,
    ) {
        let text = sync::build_synchronous_standby_names(decision, &self.config.name, server_version);
        self.last_written_params
            .lock()
            .insert("synchronous_standby_names".to_string(), text);
    }

    async fn demote_fast(&self) -> Result<(), SupervisorError> {
        self.process.stop(StopMode::Fast, Duration::from_secs(30)).await?;
        self.process.local.lock().role = DbRole::Demoted;
        Ok(())
    }

    /// Failover eligibility: our LSN must be within `maximum_lag_on_failover` of
    /// the best peer, we must not be `nofailover`, and we must have a strictly
    /// higher `failover_priority` than every reachable peer at the same LSN.
    fn is_eligible_for_failover(&self, snapshot: &ClusterSnapshot) -> bool {
        if !self.tags.is_failover_eligible() {
            return false;
        }
        let my_lsn = self.process.local.lock().flush_lsn;
        let max_peer_lsn = snapshot
            .members
            .iter()
            .filter(|m| m.name != self.config.name)
            .map(|m| m.xlog_location)
            .max()
            .unwrap_or(0);
        if my_lsn + self.config.maximum_lag_on_failover < max_peer_lsn {
            return false;
        }
        !snapshot.members.iter().any(|m| {
            m.name != self.config.name
                && m.xlog_location == my_lsn
                && m.tags.effective_failover_priority() > self.tags.effective_failover_priority()
        })
    }

    /// Lower `failover_priority` loses; ties broken by higher `flush_lsn`;
    /// final tiebreak by lexicographic name.
    fn best_failover_candidate<'a>(&self, snapshot: &'a ClusterSnapshot) -> Option<&'a Member> {
        snapshot
            .members
            .iter()
            .filter(|m| m.name != self.config.name && m.tags.is_failover_eligible())
            .max_by(|a, b| {
                a.tags
                    .effective_failover_priority()
                    .cmp(&b.tags.effective_failover_priority())
                    .then(a.xlog_location.cmp(&b.xlog_location))
                    .then(b.name.cmp(&a.name))
            })
    }

    async fn touch_member(&self) -> Result<(), SupervisorError> {
        let local = self.process.local.lock().clone();
        let member = Member {
            name: self.config.name.clone(),
            api_url: String::new(),
            conn_url: String::new(),
            role: match local.role {
                DbRole::Primary => MemberRole::Primary,
                DbRole::Replica => MemberRole::Replica,
                DbRole::StandbyLeader => MemberRole::StandbyLeader,
                DbRole::Demoted => MemberRole::Demoted,
                DbRole::Uninitialized => MemberRole::Uninitialized,
            },
            state: match local.state {
                DbState::Running => MemberHealth::Running,
                DbState::Starting => MemberHealth::Starting,
                DbState::Crashed => MemberHealth::Crashed,
                _ => MemberHealth::Stopped,
            },
            tags: self.tags.clone(),
            xlog_location: local.flush_lsn,
            timeline: local.timeline,
            version: local.major_version.map(|v| v.to_string()),
            session: self.config.name.clone(),
        };
        debug!(name = %member.name, role = %member.role, "heartbeating member record");
        self.dcs.touch_member(member, self.config.ttl).await?;
        Ok(())
    }

    /// Base interval is `loop_wait`, bounded above by the lease TTL minus a
    /// safety margin.
    pub fn next_tick_interval(&self) -> Duration {
        let safety_margin = Duration::from_secs(2).min(self.config.ttl / 4);
        self.config.loop_wait.min(self.config.ttl.saturating_sub(safety_margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dcs::memory::InMemoryDcs;
    use crate::core::process::runner::ScriptedCommandRunner;
    use crate::core::snapshot::{DynamicConfig, SynchronousMode};
    use std::path::PathBuf;

    struct StubObserver;

    #[async_trait]
    impl Observer for StubObserver {
        async fn observed_parameters(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
        async fn flush_lsn(&self) -> u64 {
            100
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

    fn make_loop(name: &str, dcs: Arc<InMemoryDcs>) -> ControlLoop<ScriptedCommandRunner, StubObserver> {
        let process = Arc::new(ProcessManager::new(
            ScriptedCommandRunner::default(),
            PathBuf::from("/tmp/data"),
            PathBuf::from("/usr/bin"),
        ));
        let executor = AsyncExecutor::spawn(|_a, _c, _t| async { true });
        ControlLoop::new(
            ControlLoopConfig {
                name: name.to_string(),
                ttl: Duration::from_secs(30),
                loop_wait: Duration::from_secs(10),
                retry_timeout: Duration::from_secs(10),
                maximum_lag_on_failover: 100,
                paused: false,
            },
            Tags::default(),
            dcs,
            process,
            Arc::new(StubObserver),
            executor,
            Arc::new(AlwaysConfirmFailsafe),
        )
    }

    #[tokio::test]
    async fn unheld_key_uneligible_replica_follows_instead_of_acquiring() {
        let dcs = Arc::new(InMemoryDcs::new());
        dcs.seed_config(DynamicConfig {
            synchronous_mode: SynchronousMode::Off,
            ..Default::default()
        });
        let loop_a = make_loop("a", dcs.clone());
        loop_a.process.local.lock().role = DbRole::Replica;

        // Peer 'b' is far ahead and higher priority, so 'a' must not try to acquire.
        let mut tags_b = Tags::default();
        tags_b.failover_priority = 5;
        dcs.touch_member(
            Member {
                name: "b".into(),
                api_url: String::new(),
                conn_url: "postgres://b".into(),
                role: MemberRole::Replica,
                state: MemberHealth::Running,
                tags: tags_b,
                xlog_location: 10_000,
                timeline: 1,
                version: None,
                session: "b".into(),
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let outcome = loop_a.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::FollowedLeader(name) if name == "b"));
    }

    #[tokio::test]
    async fn paused_loop_never_promotes_or_demotes() {
        let dcs = Arc::new(InMemoryDcs::new());
        let mut loop_a = make_loop("a", dcs);
        loop_a.config.paused = true;
        assert_eq!(loop_a.tick().await.unwrap(), TickOutcome::NoOpPaused);
    }

    struct UnreachableDcs {
        inner: InMemoryDcs,
    }

    #[async_trait]
    impl Dcs for UnreachableDcs {
        async fn get_cluster(&self) -> Result<ClusterSnapshot, crate::core::dcs::DcsError> {
            Err(crate::core::dcs::DcsError::Unavailable("simulated outage".into()))
        }
        async fn initialize_cluster(&self, system_id: &str) -> Result<bool, crate::core::dcs::DcsError> {
            self.inner.initialize_cluster(system_id).await
        }
        async fn attempt_to_acquire_leader(
            &self,
            name: &str,
            ttl: Duration,
        ) -> Result<bool, crate::core::dcs::DcsError> {
            self.inner.attempt_to_acquire_leader(name, ttl).await
        }
        async fn update_leader(
            &self,
            name: &str,
            ttl: Duration,
            last_lsn: u64,
        ) -> Result<bool, crate::core::dcs::DcsError> {
            self.inner.update_leader(name, ttl, last_lsn).await
        }
        async fn take_leader(&self, name: &str, ttl: Duration) -> Result<(), crate::core::dcs::DcsError> {
            self.inner.take_leader(name, ttl).await
        }
        async fn release_leader(&self, name: &str) -> Result<(), crate::core::dcs::DcsError> {
            self.inner.release_leader(name).await
        }
        async fn set_failover_value(
            &self,
            value: Option<crate::core::snapshot::FailoverRecord>,
            version: Option<u64>,
        ) -> Result<bool, crate::core::dcs::DcsError> {
            self.inner.set_failover_value(value, version).await
        }
        async fn set_sync_state(
            &self,
            value: &crate::core::snapshot::SyncState,
            version: Option<u64>,
        ) -> Result<u64, crate::core::dcs::DcsError> {
            self.inner.set_sync_state(value, version).await
        }
        async fn set_history_value(
            &self,
            entry: crate::core::snapshot::HistoryEntry,
        ) -> Result<(), crate::core::dcs::DcsError> {
            self.inner.set_history_value(entry).await
        }
        async fn manual_failover(
            &self,
            leader: Option<String>,
            candidate: Option<String>,
            scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<(), crate::core::dcs::DcsError> {
            self.inner.manual_failover(leader, candidate, scheduled_at).await
        }
        async fn watch(
            &self,
            leader_version: Option<u64>,
            timeout: Duration,
        ) -> Result<bool, crate::core::dcs::DcsError> {
            self.inner.watch(leader_version, timeout).await
        }
        async fn touch_member(
            &self,
            data: Member,
            ttl: Duration,
        ) -> Result<bool, crate::core::dcs::DcsError> {
            self.inner.touch_member(data, ttl).await
        }
    }

    struct DenyFailsafe;

    #[async_trait]
    impl FailsafeClient for DenyFailsafe {
        async fn confirm_leader(&self, _member_api_url: &str, _leader_name: &str) -> bool {
            false
        }
    }

    fn make_failsafe_loop(
        failsafe: Arc<dyn FailsafeClient>,
    ) -> ControlLoop<ScriptedCommandRunner, StubObserver> {
        let process = Arc::new(ProcessManager::new(
            ScriptedCommandRunner::default(),
            PathBuf::from("/tmp/data"),
            PathBuf::from("/usr/bin"),
        ));
        let executor = AsyncExecutor::spawn(|_a, _c, _t| async { true });
        ControlLoop::new(
            ControlLoopConfig {
                name: "a".to_string(),
                ttl: Duration::from_secs(30),
                loop_wait: Duration::from_secs(10),
                retry_timeout: Duration::from_millis(50),
                maximum_lag_on_failover: 100,
                paused: false,
            },
            Tags::default(),
            Arc::new(UnreachableDcs {
                inner: InMemoryDcs::new(),
            }),
            process,
            Arc::new(StubObserver),
            executor,
            failsafe,
        )
    }

    #[tokio::test]
    async fn leader_retains_status_during_dcs_outage_when_peers_confirm() {
        let loop_a = make_failsafe_loop(Arc::new(AlwaysConfirmFailsafe));
        loop_a.process.local.lock().role = DbRole::Primary;
        assert_eq!(loop_a.tick().await.unwrap(), TickOutcome::RemainedLeaderFailsafe);
        assert_eq!(loop_a.process.local.lock().role, DbRole::Primary);
    }

    #[tokio::test]
    async fn leader_demotes_during_dcs_outage_when_a_peer_refuses_to_confirm() {
        let loop_a = make_failsafe_loop(Arc::new(DenyFailsafe));
        loop_a.process.local.lock().role = DbRole::Primary;
        loop_a
            .last_known_members
            .lock()
            .push(crate::core::snapshot::Member {
                name: "b".into(),
                api_url: "http://b".into(),
                conn_url: "postgres://b".into(),
                role: MemberRole::Replica,
                state: MemberHealth::Running,
                tags: Tags::default(),
                xlog_location: 0,
                timeline: 1,
                version: None,
                session: "b".into(),
            });
        assert_eq!(loop_a.tick().await.unwrap(), TickOutcome::DemotedFailsafeLost);
        assert_eq!(loop_a.process.local.lock().role, DbRole::Demoted);
    }

    #[tokio::test]
    async fn replica_takes_no_action_during_dcs_outage() {
        let loop_a = make_failsafe_loop(Arc::new(DenyFailsafe));
        loop_a.process.local.lock().role = DbRole::Replica;
        assert_eq!(loop_a.tick().await.unwrap(), TickOutcome::NoOpDcsUnreachable);
    }

    #[tokio::test]
    async fn split_brain_stale_leader_key_triggers_immediate_demotion() {
        // S6: we think we hold the leader key per a stale snapshot, but another
        // agent already holds it.
        let dcs = Arc::new(InMemoryDcs::new());
        dcs.attempt_to_acquire_leader("rival", Duration::from_secs(30))
            .await
            .unwrap();
        let loop_a = make_loop("a", dcs);
        loop_a.process.local.lock().role = DbRole::Primary;

        let outcome = loop_a.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::DemotedSplitBrain);
        assert_eq!(loop_a.process.local.lock().role, DbRole::Demoted);
    }

    #[tokio::test]
    async fn manual_failover_steps_down_a_confirmed_leader_for_an_eligible_candidate() {
        let dcs = Arc::new(InMemoryDcs::new());
        dcs.seed_config(DynamicConfig {
            synchronous_mode: SynchronousMode::Off,
            ..Default::default()
        });
        dcs.attempt_to_acquire_leader("a", Duration::from_secs(30))
            .await
            .unwrap();
        dcs.touch_member(
            Member {
                name: "b".into(),
                api_url: "http://b".into(),
                conn_url: "postgres://b".into(),
                role: MemberRole::Replica,
                state: MemberHealth::Running,
                tags: Tags::default(),
                xlog_location: 100,
                timeline: 1,
                version: None,
                session: "b".into(),
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        dcs.manual_failover(Some("a".into()), Some("b".into()), None)
            .await
            .unwrap();

        let loop_a = make_loop("a", dcs.clone());
        loop_a.process.local.lock().role = DbRole::Primary;
        loop_a.process.local.lock().flush_lsn = 100;

        let outcome = loop_a.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::DemotedVoluntarily);
        assert_eq!(loop_a.process.local.lock().role, DbRole::Demoted);
        assert!(dcs.get_cluster().await.unwrap().failover.is_none());
    }

    #[tokio::test]
    async fn manual_failover_refuses_to_hand_off_to_a_lagging_candidate() {
        let dcs = Arc::new(InMemoryDcs::new());
        dcs.seed_config(DynamicConfig {
            synchronous_mode: SynchronousMode::Off,
            ..Default::default()
        });
        dcs.attempt_to_acquire_leader("a", Duration::from_secs(30))
            .await
            .unwrap();
        dcs.touch_member(
            Member {
                name: "b".into(),
                api_url: "http://b".into(),
                conn_url: "postgres://b".into(),
                role: MemberRole::Replica,
                state: MemberHealth::Running,
                tags: Tags::default(),
                xlog_location: 0,
                timeline: 1,
                version: None,
                session: "b".into(),
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        dcs.manual_failover(Some("a".into()), Some("b".into()), None)
            .await
            .unwrap();

        let loop_a = make_loop("a", dcs.clone());
        loop_a.process.local.lock().role = DbRole::Primary;
        loop_a.process.local.lock().flush_lsn = 1000;

        let outcome = loop_a.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::RemainedLeader);
        assert_eq!(loop_a.process.local.lock().role, DbRole::Primary);
        assert!(dcs.get_cluster().await.unwrap().failover.is_some());
    }
}
