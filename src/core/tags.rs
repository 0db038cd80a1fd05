// src/core/tags.rs

//! Per-member role tags: typed replacement for what the original implementation
//! kept as a loose dynamic mapping. Filtering ("drop falsey non-defaults") is a
//! pure function over this record rather than a dict-walk.

use serde::{Deserialize, Serialize};

/// Default failover priority for a member that does not set one explicitly.
pub const DEFAULT_FAILOVER_PRIORITY: u32 = 1;

/// Default sync priority for a member that does not set one explicitly.
pub const DEFAULT_SYNC_PRIORITY: u32 = 0;

/// Role tags advertised by a member in its DCS record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tags {
    pub nofailover: bool,
    pub failover_priority: u32,
    pub nosync: bool,
    pub sync_priority: u32,
    pub noloadbalance: bool,
    pub clonefrom: Option<String>,
    pub replicatefrom: Option<String>,
    pub nostream: bool,
}

impl Default for Tags {
    fn default() -> Self {
        Self {
            nofailover: false,
            failover_priority: DEFAULT_FAILOVER_PRIORITY,
            nosync: false,
            sync_priority: DEFAULT_SYNC_PRIORITY,
            noloadbalance: false,
            clonefrom: None,
            replicatefrom: None,
            nostream: false,
        }
    }
}

impl Tags {
    /// A `failover_priority` of 0 is equivalent to `nofailover = true`.
    pub fn effective_failover_priority(&self) -> u32 {
        if self.nofailover {
            0
        } else {
            self.failover_priority
        }
    }

    pub fn is_failover_eligible(&self) -> bool {
        self.effective_failover_priority() > 0
    }

    /// Drops fields that are at their default falsey value, unless a companion
    /// priority field has been explicitly set to something non-default — mirrors
    /// the "falsey non-default" filter rule from the tag dictionary this type
    /// replaces.
    pub fn to_sparse_map(&self) -> std::collections::BTreeMap<String, String> {
        let mut out = std::collections::BTreeMap::new();
        if self.nofailover {
            out.insert("nofailover".into(), "true".into());
        }
        if self.failover_priority != DEFAULT_FAILOVER_PRIORITY {
            out.insert("failover_priority".into(), self.failover_priority.to_string());
        }
        if self.nosync {
            out.insert("nosync".into(), "true".into());
        }
        if self.sync_priority != DEFAULT_SYNC_PRIORITY {
            out.insert("sync_priority".into(), self.sync_priority.to_string());
        }
        if self.noloadbalance {
            out.insert("noloadbalance".into(), "true".into());
        }
        if let Some(clonefrom) = &self.clonefrom {
            out.insert("clonefrom".into(), clonefrom.clone());
        }
        if let Some(replicatefrom) = &self.replicatefrom {
            out.insert("replicatefrom".into(), replicatefrom.clone());
        }
        if self.nostream {
            out.insert("nostream".into(), "true".into());
        }
        out
    }
}
