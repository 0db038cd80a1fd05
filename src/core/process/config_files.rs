// src/core/process/config_files.rs

//! Writes the on-disk configuration files this agent owns exclusively (§6,
//! "DB configuration files written"): `postgresql.conf` (a small prelude plus
//! include directives, never hand-edited), the managed, sanitized
//! `postgresql.auto.conf` that actually carries the reconciled GUCs,
//! `pg_hba.conf`/`pg_ident.conf` when the dynamic config supplies them, and
//! the `.pgpass` entry backing `primary_conninfo`'s replication credential.
//! Every write goes through a temp-file-then-rename, the same atomicity
//! `core/persistence/spldb.rs::save` uses for its own on-disk snapshots, so a
//! reader (or the postmaster itself, mid-restart) never observes a half
//! written file.

use std::collections::BTreeMap;
use std::path::Path;

use crate::core::errors::SupervisorError;

const MANAGED_PRELUDE: &str = "# Do not edit this file manually!\n\
     # It will be overwritten by this agent on every restart.\n";

/// GUCs this agent will never let `postgresql.auto.conf` carry: changing any
/// of them out from under the managed file could lock the agent itself out
/// of the very process it supervises (unreachable over the network/socket it
/// expects, or no longer answering to the `scope` it was told to manage).
const UNSAFE_AUTO_CONF_KEYS: &[&str] = &["listen_addresses", "port", "unix_socket_directories"];

/// `postgresql.conf`: a fixed prelude plus include directives for the
/// operator-owned `postgresql.base.conf` (never touched by this agent) and
/// the agent-managed `postgresql.auto.conf`. Idempotent — always rewritten to
/// the same fixed shape, since this file is never partially hand-edited for
/// fields this agent cares about.
pub fn write_postgresql_conf(data_dir: &Path) -> Result<(), SupervisorError> {
    let mut contents = String::from(MANAGED_PRELUDE);
    contents.push_str("include 'postgresql.base.conf'\n");
    contents.push_str("include 'postgresql.auto.conf'\n");
    atomic_write(&data_dir.join("postgresql.conf"), &contents)
}

/// `postgresql.auto.conf`: the reconciled parameter set, minus any
/// [`UNSAFE_AUTO_CONF_KEYS`] entries, sanitized out on every write rather
/// than only at restart time so a reload can never apply one either.
pub fn write_auto_conf(
    data_dir: &Path,
    parameters: &BTreeMap<String, String>,
) -> Result<(), SupervisorError> {
    let mut contents = String::from(MANAGED_PRELUDE);
    for (name, value) in parameters {
        if UNSAFE_AUTO_CONF_KEYS.contains(&name.as_str()) {
            tracing::warn!(parameter = %name, "refusing to write unsafe key into postgresql.auto.conf");
            continue;
        }
        contents.push_str(&format!("{name} = '{}'\n", escape_value(value)));
    }
    atomic_write(&data_dir.join("postgresql.auto.conf"), &contents)
}

/// `pg_hba.conf`, written verbatim from the dynamic config's `pg_hba` list
/// when the operator supplies one; a no-op when empty, leaving whatever the
/// operator already placed there untouched.
pub fn write_hba_conf(data_dir: &Path, lines: &[String]) -> Result<(), SupervisorError> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut contents = String::from("# Managed by this agent from the cluster's dynamic config.\n");
    for line in lines {
        contents.push_str(line);
        contents.push('\n');
    }
    atomic_write(&data_dir.join("pg_hba.conf"), &contents)
}

/// `pg_ident.conf`, same shape as [`write_hba_conf`].
pub fn write_ident_conf(data_dir: &Path, lines: &[String]) -> Result<(), SupervisorError> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut contents = String::from("# Managed by this agent from the cluster's dynamic config.\n");
    for line in lines {
        contents.push_str(line);
        contents.push('\n');
    }
    atomic_write(&data_dir.join("pg_ident.conf"), &contents)
}

/// Writes a `.pgpass` entry (mode 0600, as Postgres's `libpq` requires or it
/// refuses to read the file) backing the replication connection's password,
/// so `primary_conninfo` never needs the password embedded in plain text in
/// a config file this agent also logs from.
pub fn write_pgpass(
    data_dir: &Path,
    host: &str,
    port: u16,
    user: &str,
    password: &str,
) -> Result<(), SupervisorError> {
    let line = format!("{host}:{port}:*:{user}:{password}\n");
    let path = data_dir.join(".pgpass");
    atomic_write(&path, &line)?;
    set_owner_only_permissions(&path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), SupervisorError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), SupervisorError> {
    Ok(())
}

fn escape_value(value: &str) -> String {
    value.replace('\'', "''")
}

fn atomic_write(path: &Path, contents: &str) -> Result<(), SupervisorError> {
    let temp_path = path.with_extension(format!(
        "tmp.{}",
        rand::random::<u32>()
    ));
    std::fs::write(&temp_path, contents)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
