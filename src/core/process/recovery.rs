// src/core/process/recovery.rs

//! Version-gated recovery configuration. Prior to major version 12 these
//! parameters live in a separate `recovery.conf` read only at start; from 12
//! onward they live inline in the managed config and most of them can be
//! hot-reloaded. `primary_slot_name` is the one parameter that still demands
//! a restart even on 12+, because changing it requires re-establishing the
//! replication slot.

use std::path::Path;

use crate::core::errors::SupervisorError;

/// In the same `server_version_num / 100` unit `Observer::server_version`
/// reports (e.g. 1100 for PG11, 1400 for PG14) — not a bare major number.
pub const RECOVERY_CONFIG_VERSION_CUTOVER: u32 = 1200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryParams {
    pub primary_conninfo: String,
    pub primary_slot_name: Option<String>,
    pub recovery_target_timeline: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub requires_restart: bool,
}

/// Writes the recovery configuration for `server_version` (in the observer's
/// `server_version_num / 100` unit) and reports whether applying it demands a
/// restart (vs. a reload).
pub fn write_recovery_config(
    server_version: u32,
    params: &RecoveryParams,
    data_dir: &Path,
) -> Result<RecoveryPlan, SupervisorError> {
    if server_version < RECOVERY_CONFIG_VERSION_CUTOVER {
        write_legacy_recovery_conf(params, data_dir)?;
        // Pre-12, recovery parameters are read only at postmaster start.
        return Ok(RecoveryPlan {
            requires_restart: true,
        });
    }

    write_inline_recovery_params(params, data_dir)?;
    Ok(RecoveryPlan {
        requires_restart: params.primary_slot_name.is_some(),
    })
}

fn write_legacy_recovery_conf(
    params: &RecoveryParams,
    data_dir: &Path,
) -> Result<(), SupervisorError> {
    let mut contents = String::from("# Managed recovery configuration; do not edit manually.\n");
    contents.push_str("standby_mode = 'on'\n");
    contents.push_str(&format!(
        "primary_conninfo = '{}'\n",
        escape_conninfo(&params.primary_conninfo)
    ));
    if let Some(slot) = &params.primary_slot_name {
        contents.push_str(&format!("primary_slot_name = '{slot}'\n"));
    }
    if let Some(timeline) = params.recovery_target_timeline {
        contents.push_str(&format!("recovery_target_timeline = '{timeline}'\n"));
    } else {
        contents.push_str("recovery_target_timeline = 'latest'\n");
    }
    std::fs::write(data_dir.join("recovery.conf"), contents)?;
    Ok(())
}

fn write_inline_recovery_params(
    params: &RecoveryParams,
    data_dir: &Path,
) -> Result<(), SupervisorError> {
    let mut contents = String::from("# Managed recovery parameters; do not edit manually.\n");
    contents.push_str(&format!(
        "primary_conninfo = '{}'\n",
        escape_conninfo(&params.primary_conninfo)
    ));
    if let Some(slot) = &params.primary_slot_name {
        contents.push_str(&format!("primary_slot_name = '{slot}'\n"));
    }
    if let Some(timeline) = params.recovery_target_timeline {
        contents.push_str(&format!("recovery_target_timeline = '{timeline}'\n"));
    }
    std::fs::write(data_dir.join("patroni.recovery.conf"), contents)?;
    // A `standby.signal` file is what actually puts a >=12 server into standby mode.
    std::fs::write(data_dir.join("standby.signal"), "")?;
    Ok(())
}

fn escape_conninfo(value: &str) -> String {
    value.replace('\'', "''")
}
