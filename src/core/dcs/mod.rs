// src/core/dcs/mod.rs

//! The DCS client abstraction (C1): a small capability-set trait, polymorphic
//! over backends. Mirrors the "interface + implementations, avoid deep
//! inheritance" guidance by keeping this a flat `async_trait`, the same way
//! `WardenClient` sits behind a trait so the monitor logic never talks to a
//! concrete network type directly.
//!
//! Only an in-memory reference backend ([`memory::InMemoryDcs`]) lives in this
//! crate. Real etcd/Consul/ZooKeeper/Kubernetes drivers are out of scope; they
//! would be additional implementations of this same trait.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::snapshot::{ClusterSnapshot, FailoverRecord, HistoryEntry, SyncState};

/// Failure modes a DCS call can surface. `Conflict` is not really an error —
/// it means "someone else already holds the thing you tried to CAS" — but it
/// is kept distinct from `Unavailable` because the control loop reacts to the
/// two very differently (one is "I lost the race", the other is "retry me").
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DcsError {
    #[error("CAS conflict: value changed since last read")]
    Conflict,
    #[error("DCS backend unavailable: {0}")]
    Unavailable(String),
    #[error("key not found")]
    NotFound,
}

#[async_trait]
pub trait Dcs: Send + Sync {
    /// Single point-in-time read of the whole keyspace for this scope.
    async fn get_cluster(&self) -> Result<ClusterSnapshot, DcsError>;

    /// CAS-create `/initialize` with the given system identifier. Write-once:
    /// returns `true` iff this call is the one that set it, `false` if the
    /// cluster was already initialized by someone else.
    async fn initialize_cluster(&self, system_id: &str) -> Result<bool, DcsError>;

    /// CAS-create the leader key with the configured TTL. Returns `true` iff this
    /// agent now holds the lease; idempotent if it already does.
    async fn attempt_to_acquire_leader(&self, name: &str, ttl: Duration) -> Result<bool, DcsError>;

    /// Refresh the lease. Returns `false` (not an error) if another holder is observed.
    async fn update_leader(
        &self,
        name: &str,
        ttl: Duration,
        last_lsn: u64,
    ) -> Result<bool, DcsError>;

    /// Forceful create, used at bootstrap.
    async fn take_leader(&self, name: &str, ttl: Duration) -> Result<(), DcsError>;

    /// Forceful delete, used on graceful shutdown / voluntary demotion.
    async fn release_leader(&self, name: &str) -> Result<(), DcsError>;

    async fn set_failover_value(
        &self,
        value: Option<FailoverRecord>,
        version: Option<u64>,
    ) -> Result<bool, DcsError>;

    /// Returns the new version on success.
    async fn set_sync_state(
        &self,
        value: &SyncState,
        version: Option<u64>,
    ) -> Result<u64, DcsError>;

    async fn set_history_value(&self, entry: HistoryEntry) -> Result<(), DcsError>;

    async fn manual_failover(
        &self,
        leader: Option<String>,
        candidate: Option<String>,
        scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), DcsError>;

    /// Block up to `timeout` or until something relevant changes. Returns `true`
    /// iff a change was observed before the timeout elapsed.
    async fn watch(&self, leader_version: Option<u64>, timeout: Duration) -> Result<bool, DcsError>;

    /// Heartbeat this agent's own member record with a TTL. Must be safe to call
    /// from any local state.
    async fn touch_member(
        &self,
        data: crate::core::snapshot::Member,
        ttl: Duration,
    ) -> Result<bool, DcsError>;
}
