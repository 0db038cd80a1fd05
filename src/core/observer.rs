// src/core/observer.rs

//! The production [`ha::Observer`] implementation: the only place this crate
//! touches the database's own SQL surface, and only for three read-only
//! facts (`pg_settings`, the current flush LSN, `server_version_num`). Kept
//! to a `psql -tAc` one-shot per call, the same subprocess idiom
//! `process::runner::TokioCommandRunner` uses for `pg_ctl`, rather than
//! pulling in a full wire-protocol client for a handful of scalar reads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::core::ha::Observer;

pub struct PsqlObserver {
    pub connect_address: String,
    pub psql_path: String,
}

impl PsqlObserver {
    pub fn new(connect_address: String) -> Self {
        Self {
            connect_address,
            psql_path: "psql".to_string(),
        }
    }

    async fn query_one(&self, sql: &str) -> Option<String> {
        let output = Command::new(&self.psql_path)
            .args(["-h", &self.connect_address, "-tAc", sql])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            warn!(sql, "psql query failed");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Observer for PsqlObserver {
    async fn observed_parameters(&self) -> BTreeMap<String, String> {
        let Some(raw) = self
            .query_one("select name || '=' || setting from pg_settings")
            .await
        else {
            return BTreeMap::new();
        };
        raw.lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn flush_lsn(&self) -> u64 {
        self.query_one("select pg_current_wal_flush_lsn() - '0/0'")
            .await
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    async fn server_version(&self) -> u32 {
        self.query_one("show server_version_num")
            .await
            .and_then(|s| s.parse().ok())
            .unwrap_or(140_000)
            / 100
    }
}
