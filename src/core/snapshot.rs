// src/core/snapshot.rs

//! The cluster snapshot value type: an immutable, point-in-time read of the DCS
//! keyspace for one `scope`. Where the original implementation passed around a
//! loosely-typed record and rebuilt it with `_asdict()`-style partial updates,
//! this is a plain immutable struct plus a `with_members`/`with_sync` builder.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::tags::Tags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    Off,
    On,
    Quorum,
}

impl Default for SynchronousMode {
    fn default() -> Self {
        SynchronousMode::Off
    }
}

/// Versioned dynamic configuration, shared by every member via the DCS `/config` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub ttl: u64,
    pub loop_wait: u64,
    pub retry_timeout: u64,
    pub synchronous_mode: SynchronousMode,
    pub synchronous_node_count: u32,
    pub maximum_lag_on_failover: u64,
    pub master_start_timeout: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub pg_hba: Vec<String>,
    #[serde(default)]
    pub pg_ident: Vec<String>,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            ttl: 30,
            loop_wait: 10,
            retry_timeout: 10,
            synchronous_mode: SynchronousMode::Off,
            synchronous_node_count: 1,
            maximum_lag_on_failover: 1_048_576,
            master_start_timeout: 300,
            parameters: BTreeMap::new(),
            pg_hba: Vec::new(),
            pg_ident: Vec::new(),
        }
    }
}

/// `Serialize`/`Deserialize` give the wire representation stored in DCS;
/// `Display` (via `strum`) gives the snake_case form used in log fields,
/// matching the distinct wire-vs-log derive split search/schema.rs uses for
/// `FieldType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "snake_case")]
pub enum MemberRole {
    Primary,
    Replica,
    StandbyLeader,
    Demoted,
    Uninitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberHealth {
    Running,
    Starting,
    Stopped,
    Crashed,
}

/// A single member's advertised record (`/members/<name>`, TTL-backed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub api_url: String,
    pub conn_url: String,
    pub role: MemberRole,
    pub state: MemberHealth,
    #[serde(default)]
    pub tags: Tags,
    pub xlog_location: u64,
    pub timeline: u32,
    pub version: Option<String>,
    /// The DCS-granted lease identity backing this record's TTL.
    pub session: String,
}

/// The leader key: presence means "locked", absence means "unlocked".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leader {
    pub name: String,
    pub session: String,
    pub renew_deadline: DateTime<Utc>,
}

/// A pending manual/scheduled failover request (`/failover`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub leader: Option<String>,
    pub candidate: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// The synchronous-replication state record (`/sync`, CAS-versioned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u64,
    pub leader: Option<String>,
    pub sync_standby: std::collections::BTreeSet<String>,
    pub quorum: u32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: 0,
            leader: None,
            sync_standby: std::collections::BTreeSet::new(),
            quorum: 0,
        }
    }
}

/// Why a particular timeline switch happened, per `/history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionReason {
    NoRecoveryTargetSpecified,
    ReceivedPromoteTrigger,
    CrashRecovery,
    ManualFailover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timeline: u32,
    pub switch_lsn: u64,
    pub reason: PromotionReason,
    pub timestamp: DateTime<Utc>,
    pub new_leader: String,
}

/// Leader-advertised advisory status (`/status`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub last_lsn: u64,
    #[serde(default)]
    pub slots: BTreeMap<String, u64>,
}

/// An immutable, point-in-time read of the DCS keyspace for one `scope`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub initialize: Option<String>,
    pub config: DynamicConfig,
    pub leader: Option<Leader>,
    pub members: Vec<Member>,
    pub failover: Option<FailoverRecord>,
    pub sync: SyncState,
    pub status: Status,
    pub history: Vec<HistoryEntry>,
}

impl ClusterSnapshot {
    pub fn empty() -> Self {
        Self {
            initialize: None,
            config: DynamicConfig::default(),
            leader: None,
            members: Vec::new(),
            failover: None,
            sync: SyncState::default(),
            status: Status::default(),
            history: Vec::new(),
        }
    }

    /// Builder: returns a copy with a new member set. Members are kept ordered by name,
    /// matching the "ordered set by name" invariant from the data model.
    pub fn with_members(&self, mut members: Vec<Member>) -> Self {
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            members,
            ..self.clone()
        }
    }

    pub fn with_sync(&self, sync: SyncState) -> Self {
        Self {
            sync,
            ..self.clone()
        }
    }

    pub fn leader_name(&self) -> Option<&str> {
        self.leader.as_ref().map(|l| l.name.as_str())
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}
