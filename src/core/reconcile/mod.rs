// src/core/reconcile/mod.rs

//! The config reconciler (C3): diffs desired parameters against what the
//! database reports it is actually running, and classifies each change as
//! hot-reloadable, restart-required, or an externally-applied change this
//! agent did not make.

pub mod validators;

use std::collections::BTreeMap;

use tracing::warn;

use validators::{lookup, validate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamChange {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub reload_list: BTreeMap<String, ParamChange>,
    pub restart_list: BTreeMap<String, ParamChange>,
    pub external_changes: BTreeMap<String, ParamChange>,
    pub removed: Vec<String>,
}

/// `P_d`: desired parameters (from merged dynamic+local config).
/// `P_o`: observed parameters (from `pg_settings` plus the effective config file).
/// `last_written`: what this agent itself last wrote for each parameter, used to
/// detect changes an operator made directly against the database.
pub fn reconcile(
    desired: &BTreeMap<String, String>,
    observed: &BTreeMap<String, String>,
    last_written: &BTreeMap<String, String>,
    server_version: u32,
) -> ReconcileResult {
    let mut result = ReconcileResult::default();

    for (name, raw_value) in desired {
        let Some(entry) = lookup(name, server_version) else {
            warn!(parameter = %name, "dropping unknown or unsupported parameter");
            result.removed.push(name.clone());
            continue;
        };

        let normalized = match validate(entry, raw_value) {
            Ok(v) => v,
            Err(issue) => {
                warn!(parameter = %name, error = %issue.0, "dropping invalid parameter value");
                result.removed.push(name.clone());
                continue;
            }
        };

        let observed_value = observed.get(name).cloned();
        if observed_value.as_deref() == Some(normalized.as_str()) {
            continue;
        }

        let change = ParamChange {
            old: observed_value.clone().unwrap_or_else(|| "?".into()),
            new: normalized.clone(),
        };

        if entry.requires_restart {
            result.restart_list.insert(name.clone(), change);
        } else {
            result.reload_list.insert(name.clone(), change);
        }
    }

    // External changes: the live value differs from what this agent last wrote,
    // independent of whether it also differs from the current desired value.
    for (name, written) in last_written {
        if let Some(observed_value) = observed.get(name)
            && observed_value != written
            && !result.restart_list.contains_key(name)
            && !result.reload_list.contains_key(name)
        {
            result.external_changes.insert(
                name.clone(),
                ParamChange {
                    old: written.clone(),
                    new: observed_value.clone(),
                },
            );
        }
    }

    result
}
