// src/core/sync.rs

//! The synchronous-replication handler (C4): picks the synchronous standby
//! set and quorum number, then the caller is responsible for writing it to
//! DCS before (on shrink) or after (on growth) relaxing
//! `synchronous_standby_names` in the database — see
//! [`SyncDecision`] and the ordering rule documented there.

use std::collections::BTreeSet;

use crate::core::snapshot::SynchronousMode;

/// Replication-state rank for a standby, used to order priority-mode picks.
/// `sync` outranks `potential`, which outranks `quorum`, which outranks `async`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncStateRank {
    Async,
    Quorum,
    Potential,
    Sync,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncCandidate {
    pub name: String,
    pub sync_state: SyncStateRank,
    pub flush_lag: u64,
    pub nosync: bool,
    pub sync_priority: u32,
    /// Set when this candidate streams from another standby rather than directly
    /// from the primary.
    pub replicatefrom: Option<String>,
    /// True when some other candidate already streams directly from the primary
    /// and could serve the same purpose as this cascading one.
    pub has_direct_streaming_equivalent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDecision {
    pub mode: SynchronousMode,
    pub quorum: u32,
    pub names: Vec<String>,
}

/// Picks synchronous standbys per §4.4. `primary_name` is defensively excluded
/// from the result even if present among the candidates: the primary must
/// never appear in its own `synchronous_standby_names`.
pub fn decide(
    mode: SynchronousMode,
    candidates: &[SyncCandidate],
    synchronous_node_count: u32,
    primary_name: &str,
) -> SyncDecision {
    let eligible: Vec<&SyncCandidate> = candidates
        .iter()
        .filter(|c| c.name != primary_name)
        .collect();

    match mode {
        SynchronousMode::Off => SyncDecision {
            mode,
            quorum: 0,
            names: Vec::new(),
        },
        SynchronousMode::On => {
            let mut picked: Vec<&SyncCandidate> = eligible
                .into_iter()
                .filter(|c| !c.nosync && c.sync_priority != 0)
                .filter(|c| !(c.replicatefrom.is_some() && c.has_direct_streaming_equivalent))
                .collect();
            picked.sort_by(|a, b| {
                b.sync_state
                    .cmp(&a.sync_state)
                    .then(a.flush_lag.cmp(&b.flush_lag))
                    .then(a.name.cmp(&b.name))
            });
            picked.truncate(synchronous_node_count.max(1) as usize);
            let mut names: Vec<String> = picked.into_iter().map(|c| c.name.clone()).collect();
            names.sort();
            let quorum = names.len() as u32;
            SyncDecision { mode, quorum, names }
        }
        SynchronousMode::Quorum => {
            let mut names: Vec<String> = eligible
                .into_iter()
                .filter(|c| {
                    matches!(
                        c.sync_state,
                        SyncStateRank::Quorum | SyncStateRank::Sync | SyncStateRank::Potential
                    )
                })
                .map(|c| c.name.clone())
                .collect();
            names.sort();
            SyncDecision {
                mode,
                quorum: synchronous_node_count,
                names,
            }
        }
    }
}

/// Builds the `synchronous_standby_names` GUC text, version-gated:
///   - < 9.6: bare name or `*` only.
///   - 9.6–9.x: `N (list)`.
///   - >= 10: `ANY q (list)` for quorum, `FIRST q (list)` for priority.
pub fn build_synchronous_standby_names(
    decision: &SyncDecision,
    primary_name: &str,
    server_version: u32,
) -> String {
    let names: Vec<&str> = decision
        .names
        .iter()
        .filter(|n| n.as_str() != primary_name)
        .map(|n| n.as_str())
        .collect();

    if names.is_empty() {
        return String::new();
    }

    if server_version < 906 {
        if names.len() > 1 {
            tracing::warn!(
                "server version {} cannot express more than one synchronous standby; falling back to '*'",
                server_version
            );
            return "*".to_string();
        }
        return names[0].to_string();
    }

    let list = names.join(",");
    if server_version < 1000 {
        let n = decision.quorum.max(1);
        return format!("{n} ({list})");
    }

    match decision.mode {
        SynchronousMode::Quorum => format!("ANY {} ({list})", decision.quorum),
        _ => format!("FIRST {} ({list})", decision.quorum.max(1)),
    }
}

/// Parses a `synchronous_standby_names` string back into names/quorum, for
/// round-trip verification. Best-effort across the version-gated syntaxes.
pub fn parse_synchronous_standby_names(raw: &str) -> (Vec<String>, u32) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (Vec::new(), 0);
    }
    if raw == "*" {
        return (vec!["*".to_string()], 1);
    }
    if let Some(rest) = raw.strip_prefix("ANY ").or_else(|| raw.strip_prefix("FIRST ")) {
        if let Some((q, list)) = rest.split_once(' ') {
            let quorum: u32 = q.parse().unwrap_or(1);
            let names = parse_name_list(list);
            return (names, quorum);
        }
    }
    if let Some((q, list)) = raw.split_once(' ') {
        if let Ok(quorum) = q.parse::<u32>() {
            return (parse_name_list(list), quorum);
        }
    }
    (vec![raw.to_string()], 1)
}

fn parse_name_list(list: &str) -> Vec<String> {
    list.trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `I2`/S1 guard: asserts the primary never appears among its own sync standbys.
pub fn assert_primary_excluded(names: &BTreeSet<String>, primary_name: &str) {
    debug_assert!(!names.contains(primary_name));
}
