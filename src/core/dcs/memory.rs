// src/core/dcs/memory.rs

//! An in-process reference DCS backend. Used by the binary for local/dev
//! operation and by the test suite to exercise the control loop without a
//! live etcd/Consul/ZooKeeper cluster. Built on the same concurrency
//! primitives used for in-memory shared state elsewhere in this codebase
//! (`DashMap` + `parking_lot::Mutex`, see `core/warden/state.rs`), plus a
//! `tokio::sync::Notify` to give `watch()` real blocking semantics instead
//! of busy-polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Dcs, DcsError};
use crate::core::snapshot::{
    ClusterSnapshot, DynamicConfig, FailoverRecord, HistoryEntry, Leader, Member, Status,
    SyncState,
};

struct LeaseEntry {
    session: String,
    expires_at: Instant,
}

/// In-memory, single-process stand-in for a real DCS. Not linearizable across
/// processes — it only exists within this binary — but it implements the same
/// CAS and TTL semantics the trait promises, which is what the control loop
/// and its tests actually depend on.
pub struct InMemoryDcs {
    initialize: Mutex<Option<String>>,
    config: Mutex<DynamicConfig>,
    leader: Mutex<Option<LeaseEntry>>,
    members: DashMap<String, (Member, Instant)>,
    failover: Mutex<(Option<FailoverRecord>, u64)>,
    sync: Mutex<SyncState>,
    history: Mutex<Vec<HistoryEntry>>,
    status: Mutex<Status>,
    version: AtomicU64,
    notify: tokio::sync::Notify,
}

impl Default for InMemoryDcs {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDcs {
    pub fn new() -> Self {
        Self {
            initialize: Mutex::new(None),
            config: Mutex::new(DynamicConfig::default()),
            leader: Mutex::new(None),
            members: DashMap::new(),
            failover: Mutex::new((None, 0)),
            sync: Mutex::new(SyncState::default()),
            history: Mutex::new(Vec::new()),
            status: Mutex::new(Status::default()),
            version: AtomicU64::new(0),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn seed_config(&self, config: DynamicConfig) {
        *self.config.lock() = config;
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn leader_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dcs for InMemoryDcs {
    async fn get_cluster(&self) -> Result<ClusterSnapshot, DcsError> {
        let now = Instant::now();
        let leader = self.leader.lock().as_ref().and_then(|entry| {
            if entry.expires_at > now {
                let remaining = entry.expires_at - now;
                Some(Leader {
                    name: String::new(),
                    session: entry.session.clone(),
                    renew_deadline: Utc::now() + remaining,
                })
            } else {
                None
            }
        });
        // The leader name is stored alongside `/leader` key, not the lease itself,
        // so recover it from the members map's matching session if present.
        let leader = leader.map(|mut l| {
            if let Some(name) = self
                .members
                .iter()
                .find(|e| e.value().0.session == l.session)
                .map(|e| e.key().clone())
            {
                l.name = name;
            }
            l
        });

        let members: Vec<Member> = self
            .members
            .iter()
            .filter(|e| e.value().1 > now)
            .map(|e| e.value().0.clone())
            .collect();

        let (failover, _fv) = self.failover.lock().clone();

        Ok(ClusterSnapshot {
            initialize: self.initialize.lock().clone(),
            config: self.config.lock().clone(),
            leader,
            members,
            failover,
            sync: self.sync.lock().clone(),
            status: self.status.lock().clone(),
            history: self.history.lock().clone(),
        })
    }

    async fn initialize_cluster(&self, system_id: &str) -> Result<bool, DcsError> {
        let mut guard = self.initialize.lock();
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(system_id.to_string());
        drop(guard);
        self.bump_version();
        Ok(true)
    }

    async fn attempt_to_acquire_leader(&self, name: &str, ttl: Duration) -> Result<bool, DcsError> {
        let mut guard = self.leader.lock();
        let now = Instant::now();
        match guard.as_ref() {
            Some(entry) if entry.expires_at > now && entry.session != name => Ok(false),
            _ => {
                *guard = Some(LeaseEntry {
                    session: name.to_string(),
                    expires_at: now + ttl,
                });
                drop(guard);
                self.bump_version();
                Ok(true)
            }
        }
    }

    async fn update_leader(
        &self,
        name: &str,
        ttl: Duration,
        last_lsn: u64,
    ) -> Result<bool, DcsError> {
        let mut guard = self.leader.lock();
        let now = Instant::now();
        match guard.as_mut() {
            Some(entry) if entry.session == name => {
                entry.expires_at = now + ttl;
                drop(guard);
                self.status.lock().last_lsn = last_lsn;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take_leader(&self, name: &str, ttl: Duration) -> Result<(), DcsError> {
        *self.leader.lock() = Some(LeaseEntry {
            session: name.to_string(),
            expires_at: Instant::now() + ttl,
        });
        self.bump_version();
        Ok(())
    }

    async fn release_leader(&self, name: &str) -> Result<(), DcsError> {
        let mut guard = self.leader.lock();
        if matches!(guard.as_ref(), Some(entry) if entry.session == name) {
            *guard = None;
            drop(guard);
            self.bump_version();
        }
        Ok(())
    }

    async fn set_failover_value(
        &self,
        value: Option<FailoverRecord>,
        version: Option<u64>,
    ) -> Result<bool, DcsError> {
        let mut guard = self.failover.lock();
        if let Some(expected) = version
            && expected != guard.1
        {
            return Ok(false);
        }
        guard.0 = value;
        guard.1 += 1;
        Ok(true)
    }

    async fn set_sync_state(
        &self,
        value: &SyncState,
        version: Option<u64>,
    ) -> Result<u64, DcsError> {
        let mut guard = self.sync.lock();
        if let Some(expected) = version
            && expected != guard.version
        {
            return Err(DcsError::Conflict);
        }
        let new_version = guard.version + 1;
        *guard = SyncState {
            version: new_version,
            ..value.clone()
        };
        Ok(new_version)
    }

    async fn set_history_value(&self, entry: HistoryEntry) -> Result<(), DcsError> {
        let mut history = self.history.lock();
        if let Some(last) = history.last()
            && entry.timeline <= last.timeline
        {
            return Err(DcsError::Conflict);
        }
        history.push(entry);
        Ok(())
    }

    async fn manual_failover(
        &self,
        leader: Option<String>,
        candidate: Option<String>,
        scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DcsError> {
        self.failover.lock().0 = Some(FailoverRecord {
            leader,
            candidate,
            scheduled_at,
        });
        self.bump_version();
        Ok(())
    }

    async fn watch(&self, leader_version: Option<u64>, timeout: Duration) -> Result<bool, DcsError> {
        if leader_version != Some(self.leader_version()) {
            return Ok(true);
        }
        tokio::select! {
            _ = self.notify.notified() => Ok(true),
            _ = tokio::time::sleep(timeout) => Ok(false),
        }
    }

    async fn touch_member(&self, data: Member, ttl: Duration) -> Result<bool, DcsError> {
        self.members
            .insert(data.name.clone(), (data, Instant::now() + ttl));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::{MemberHealth, MemberRole};
    use crate::core::tags::Tags;

    fn member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            api_url: format!("http://{name}"),
            conn_url: format!("postgres://{name}"),
            role: MemberRole::Replica,
            state: MemberHealth::Running,
            tags: Tags::default(),
            xlog_location: 0,
            timeline: 1,
            version: None,
            session: name.to_string(),
        }
    }

    #[tokio::test]
    async fn only_one_holder_can_acquire_the_lease() {
        let dcs = InMemoryDcs::new();
        assert!(
            dcs.attempt_to_acquire_leader("a", Duration::from_secs(30))
                .await
                .unwrap()
        );
        assert!(
            !dcs.attempt_to_acquire_leader("b", Duration::from_secs(30))
                .await
                .unwrap()
        );
        // Re-acquiring as the existing holder is idempotent.
        assert!(
            dcs.attempt_to_acquire_leader("a", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn update_leader_fails_for_non_holder() {
        let dcs = InMemoryDcs::new();
        dcs.attempt_to_acquire_leader("a", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!dcs.update_leader("b", Duration::from_secs(30), 0).await.unwrap());
        assert!(dcs.update_leader("a", Duration::from_secs(30), 42).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_acquired_by_someone_else() {
        let dcs = InMemoryDcs::new();
        dcs.attempt_to_acquire_leader("a", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            dcs.attempt_to_acquire_leader("b", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn sync_state_cas_rejects_stale_version() {
        let dcs = InMemoryDcs::new();
        let v1 = dcs.set_sync_state(&SyncState::default(), None).await.unwrap();
        assert_eq!(v1, 1);
        let err = dcs
            .set_sync_state(&SyncState::default(), Some(0))
            .await
            .unwrap_err();
        assert_eq!(err, DcsError::Conflict);
        assert!(
            dcs.set_sync_state(&SyncState::default(), Some(1))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn initialize_cluster_is_write_once() {
        let dcs = InMemoryDcs::new();
        assert!(dcs.initialize_cluster("system-a").await.unwrap());
        assert!(!dcs.initialize_cluster("system-b").await.unwrap());
        assert_eq!(
            dcs.get_cluster().await.unwrap().initialize,
            Some("system-a".to_string())
        );
    }

    #[tokio::test]
    async fn touch_member_then_get_cluster_reflects_it() {
        let dcs = InMemoryDcs::new();
        dcs.touch_member(member("a"), Duration::from_secs(30))
            .await
            .unwrap();
        let snapshot = dcs.get_cluster().await.unwrap();
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].name, "a");
    }

    #[tokio::test]
    async fn watch_returns_true_immediately_on_stale_version() {
        let dcs = InMemoryDcs::new();
        assert!(dcs.watch(None, Duration::from_millis(50)).await.unwrap());
    }

    #[tokio::test]
    async fn watch_times_out_with_no_change() {
        let dcs = InMemoryDcs::new();
        let current = dcs.get_cluster().await.unwrap();
        let _ = current;
        let observed = dcs.watch(Some(0), Duration::from_millis(20)).await.unwrap();
        assert!(!observed);
    }
}
