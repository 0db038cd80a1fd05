// src/core/runtime.rs

//! Wires C1–C7 together into the running process: builds the in-memory DCS
//! reference backend, the process manager, the SQL observer, and the async
//! executor, performs the bootstrap/create-replica step that precedes the
//! first control-loop tick, then drives the tick loop alongside signal
//! handling. The signal-handling shape (`tokio::signal::unix::signal` +
//! `tokio::select!`) follows the same pattern used for graceful shutdown
//! elsewhere in this codebase (`server/connection_loop.rs`), extended here
//! with SIGHUP (reload) and SIGCHLD (reap) alongside SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::Config;
use crate::core::dcs::Dcs;
use crate::core::dcs::memory::InMemoryDcs;
use crate::core::errors::SupervisorError;
use crate::core::executor::{Action, AsyncExecutor};
use crate::core::failsafe::ReqwestFailsafeClient;
use crate::core::ha::{ControlLoop, ControlLoopConfig};
use crate::core::observer::PsqlObserver;
use crate::core::process::runner::TokioCommandRunner;
use crate::core::process::{DbRole, DbState, ProcessManager, StopMode};

/// Used only as a placeholder major version during bootstrap, before the
/// process manager has ever queried the real server; `start()`/`follow()`
/// refresh it from the actual postmaster once running. In the same
/// `server_version_num / 100` unit `Observer::server_version` reports (e.g.
/// 1600 for PG16), since it flows straight into `ProcessManager::follow`.
const ASSUMED_MAJOR_VERSION: u32 = 1600;

/// Builds the collaborators, performs the one-time bootstrap step, then runs
/// the control loop until a termination signal arrives.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<(), SupervisorError> {
    let memory_dcs = Arc::new(InMemoryDcs::new());
    memory_dcs.seed_config(config.bootstrap.clone());
    let dcs: Arc<dyn Dcs> = memory_dcs;

    let mut process_manager = ProcessManager::new(
        TokioCommandRunner,
        config.data_dir.clone(),
        config.bin_dir.clone(),
    );
    if let (Some(user), Some(password)) =
        (&config.replication_username, &config.replication_password)
    {
        process_manager = process_manager.with_replication_credential(user.clone(), password.clone());
    }
    let process = Arc::new(process_manager);
    let observer = Arc::new(PsqlObserver::new(config.connect_address.clone()));

    let executor = {
        let process = process.clone();
        let dcs = dcs.clone();
        let name = config.name.clone();
        AsyncExecutor::spawn(move |action, _cancel, critical| {
            let process = process.clone();
            let dcs = dcs.clone();
            let name = name.clone();
            async move { run_action(&process, &dcs, &name, action, critical).await }
        })
    };

    bootstrap(&dcs, &process, &config).await?;

    let control = ControlLoop::new(
        ControlLoopConfig {
            name: config.name.clone(),
            ttl: Duration::from_secs(config.bootstrap.ttl),
            loop_wait: Duration::from_secs(config.bootstrap.loop_wait),
            retry_timeout: Duration::from_secs(config.bootstrap.retry_timeout),
            maximum_lag_on_failover: config.bootstrap.maximum_lag_on_failover,
            paused: false,
        },
        config.tags.clone(),
        dcs.clone(),
        process.clone(),
        observer,
        executor,
        Arc::new(ReqwestFailsafeClient::new()),
    );

    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| SupervisorError::Io(Arc::new(e)))?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| SupervisorError::Io(Arc::new(e)))?;
    // The program runs as PID 1 in containerized deployments, so it is
    // responsible for reaping any child it or a reparented grandchild leaves
    // behind; `tokio::process::Child` already reaps its own children on drop,
    // so this handler exists to drain the notification, not to call wait(2).
    let mut sigchld = signal(SignalKind::child()).map_err(|e| SupervisorError::Io(Arc::new(e)))?;

    loop {
        tokio::select! {
            biased;

            _ = sigterm.recv() => {
                info!("SIGTERM received, releasing leadership and stopping");
                let _ = dcs.release_leader(&config.name).await;
                let _ = process.stop(StopMode::Fast, Duration::from_secs(30)).await;
                return Ok(());
            }

            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match Config::from_file_path(&config.source_path) {
                    Ok(reloaded) => {
                        if let Err(e) = log_reload_handle.reload(EnvFilter::new(&reloaded.log_level)) {
                            warn!(error = %e, "failed to apply reloaded log level");
                        }
                        control.request_reload();
                    }
                    Err(e) => warn!(error = %e, "failed to reload configuration, keeping previous settings"),
                }
            }

            _ = sigchld.recv() => {}

            _ = tokio::time::sleep(control.next_tick_interval()) => {
                match control.tick().await {
                    Ok(outcome) => info!(?outcome, "tick complete"),
                    Err(e) => error!(error = %e, "tick failed, will retry next interval"),
                }
            }
        }
    }
}

async fn run_action<R: crate::core::process::runner::CommandRunner>(
    process: &Arc<ProcessManager<R>>,
    dcs: &Arc<dyn Dcs>,
    name: &str,
    action: Action,
    critical: crate::core::executor::CriticalTask,
) -> bool {
    match action {
        Action::Promote { reason } => {
            critical.commit();
            let promoted = process.promote(Duration::from_secs(300)).await.unwrap_or(false);
            if promoted {
                let local = process.local.lock().clone();
                let entry = crate::core::snapshot::HistoryEntry {
                    timeline: local.timeline,
                    switch_lsn: local.flush_lsn,
                    reason,
                    timestamp: chrono::Utc::now(),
                    new_leader: name.to_string(),
                };
                if let Err(e) = dcs.set_history_value(entry).await {
                    warn!(error = %e, "failed to append promotion history entry");
                }
            }
            promoted
        }
        Action::Restart => process
            .restart(Duration::from_secs(300))
            .await
            .unwrap_or(false),
        Action::CreateReplica { leader } => process
            .follow(&leader, ASSUMED_MAJOR_VERSION, None)
            .await
            .unwrap_or(false),
        Action::Custom(name) => {
            warn!(action = %name, "no handler registered for custom action");
            false
        }
    }
}

/// Step 4 of the control-loop design: when the local database is
/// uninitialized, either win the race to bootstrap a brand-new cluster (CAS
/// on `/initialize`) or join as a replica following the current leader.
async fn bootstrap<R: crate::core::process::runner::CommandRunner>(
    dcs: &Arc<dyn Dcs>,
    process: &Arc<ProcessManager<R>>,
    config: &Config,
) -> Result<(), SupervisorError> {
    let snapshot = dcs.get_cluster().await?;
    process.ensure_unique_name(&config.name, &snapshot.members).await?;

    if process.local.lock().state != DbState::Stopped {
        return Ok(());
    }

    if snapshot.initialize.is_none() {
        // A unique system identifier, generated the same way this codebase
        // mints any other run-scoped random identifier: raw entropy, hex
        // encoded (`core/warden/mod.rs`'s run ID generation).
        let mut id_bytes = [0u8; 16];
        getrandom::fill(&mut id_bytes)
            .map_err(|e| SupervisorError::Process(format!("failed to generate system identifier: {e}")))?;
        let system_id = hex::encode(id_bytes);
        if dcs.initialize_cluster(&system_id).await? {
            info!(%system_id, "bootstrapping new cluster as initial primary");
            process.local.lock().major_version = Some(ASSUMED_MAJOR_VERSION);
            process
                .start(Duration::from_secs(config.bootstrap.master_start_timeout))
                .await?;
            process.local.lock().role = DbRole::Primary;
            return Ok(());
        }
    }

    if let Some(leader_name) = snapshot.leader_name()
        && let Some(leader) = snapshot.member(leader_name)
    {
        info!(leader = %leader_name, "joining existing cluster as a replica");
        process.local.lock().major_version = Some(ASSUMED_MAJOR_VERSION);
        process
            .follow(&leader.conn_url, ASSUMED_MAJOR_VERSION, None)
            .await?;
        process.local.lock().role = DbRole::Replica;
    } else {
        warn!("cluster is initialized but has no leader yet; waiting for the next tick");
    }

    Ok(())
}
