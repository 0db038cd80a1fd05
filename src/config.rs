// src/config.rs

//! Loads and validates this agent's own configuration: scope/name identity,
//! the local `postgresql` binary and data directory, the bootstrap defaults
//! for the cluster-wide dynamic config, and this member's role tags. Follows
//! a permissive, serde-default-heavy `RawConfig` -> `validate()` -> `Config`
//! pattern rather than deserializing straight into the strict type.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::snapshot::{DynamicConfig, SynchronousMode};
use crate::core::tags::Tags;

fn default_namespace() -> String {
    "/service".to_string()
}

fn default_connect_address() -> String {
    "127.0.0.1:5432".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// On-disk shape, deliberately loose: every field optional so a minimal TOML
/// file is valid and gaps are filled by the same defaults a freshly bootstrapped
/// cluster would use.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConfig {
    pub scope: Option<String>,
    pub name: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub data_dir: Option<String>,
    pub bin_dir: Option<String>,
    #[serde(default = "default_connect_address")]
    pub connect_address: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Replication credential, written into `.pgpass` so `primary_conninfo`
    /// never needs the password embedded in a config file this agent also
    /// logs from. Absent when the cluster relies on `trust`/peer auth.
    pub replication_username: Option<String>,
    pub replication_password: Option<String>,
    #[serde(default)]
    pub tags: RawTags,
    #[serde(default)]
    pub bootstrap: RawBootstrap,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTags {
    #[serde(default)]
    pub nofailover: bool,
    pub failover_priority: Option<u32>,
    #[serde(default)]
    pub nosync: bool,
    pub sync_priority: Option<u32>,
    #[serde(default)]
    pub noloadbalance: bool,
    pub clonefrom: Option<String>,
    pub replicatefrom: Option<String>,
    #[serde(default)]
    pub nostream: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawBootstrap {
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_loop_wait", with = "humantime_serde")]
    pub loop_wait: Duration,
    #[serde(default = "default_retry_timeout", with = "humantime_serde")]
    pub retry_timeout: Duration,
    #[serde(default)]
    pub synchronous_mode: SynchronousModeRaw,
    #[serde(default = "default_synchronous_node_count")]
    pub synchronous_node_count: u32,
    #[serde(default = "default_maximum_lag")]
    pub maximum_lag_on_failover: u64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub pg_hba: Vec<String>,
    #[serde(default)]
    pub pg_ident: Vec<String>,
}

impl Default for RawBootstrap {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            loop_wait: default_loop_wait(),
            retry_timeout: default_retry_timeout(),
            synchronous_mode: SynchronousModeRaw::default(),
            synchronous_node_count: default_synchronous_node_count(),
            maximum_lag_on_failover: default_maximum_lag(),
            parameters: BTreeMap::new(),
            pg_hba: Vec::new(),
            pg_ident: Vec::new(),
        }
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_loop_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_synchronous_node_count() -> u32 {
    1
}

fn default_maximum_lag() -> u64 {
    1_048_576
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousModeRaw {
    #[default]
    Off,
    On,
    Quorum,
}

impl From<SynchronousModeRaw> for SynchronousMode {
    fn from(value: SynchronousModeRaw) -> Self {
        match value {
            SynchronousModeRaw::Off => SynchronousMode::Off,
            SynchronousModeRaw::On => SynchronousMode::On,
            SynchronousModeRaw::Quorum => SynchronousMode::Quorum,
        }
    }
}

impl RawConfig {
    pub fn validate(self) -> Result<Config> {
        let scope = self
            .scope
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("`scope` is required"))?;
        let name = self
            .name
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("`name` is required"))?;
        let data_dir = self
            .data_dir
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("`data_dir` is required"))?;
        let bin_dir = self.bin_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/usr/bin"));

        if self.bootstrap.retry_timeout >= self.bootstrap.ttl {
            return Err(anyhow!(
                "`retry_timeout` ({:?}) must be shorter than `ttl` ({:?})",
                self.bootstrap.retry_timeout,
                self.bootstrap.ttl
            ));
        }

        let tags = Tags {
            nofailover: self.tags.nofailover,
            failover_priority: self.tags.failover_priority.unwrap_or(crate::core::tags::DEFAULT_FAILOVER_PRIORITY),
            nosync: self.tags.nosync,
            sync_priority: self.tags.sync_priority.unwrap_or(crate::core::tags::DEFAULT_SYNC_PRIORITY),
            noloadbalance: self.tags.noloadbalance,
            clonefrom: self.tags.clonefrom,
            replicatefrom: self.tags.replicatefrom,
            nostream: self.tags.nostream,
        };

        let dynamic_config = DynamicConfig {
            ttl: self.bootstrap.ttl.as_secs(),
            loop_wait: self.bootstrap.loop_wait.as_secs(),
            retry_timeout: self.bootstrap.retry_timeout.as_secs(),
            synchronous_mode: self.bootstrap.synchronous_mode.into(),
            synchronous_node_count: self.bootstrap.synchronous_node_count,
            maximum_lag_on_failover: self.bootstrap.maximum_lag_on_failover,
            master_start_timeout: 300,
            parameters: self.bootstrap.parameters,
            pg_hba: self.bootstrap.pg_hba,
            pg_ident: self.bootstrap.pg_ident,
        };

        Ok(Config {
            scope,
            name,
            namespace: self.namespace,
            data_dir,
            bin_dir,
            connect_address: self.connect_address,
            log_level: self.log_level,
            replication_username: self.replication_username,
            replication_password: self.replication_password,
            tags,
            bootstrap: dynamic_config,
            source_path: PathBuf::new(),
        })
    }
}

/// Validated, ready-to-use configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub scope: String,
    pub name: String,
    pub namespace: String,
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub connect_address: String,
    pub log_level: String,
    pub replication_username: Option<String>,
    pub replication_password: Option<String>,
    pub tags: Tags,
    pub bootstrap: DynamicConfig,
    /// The file this configuration was loaded from, kept around so a SIGHUP
    /// reload can re-read the same path without the caller having to thread
    /// it through separately.
    pub source_path: PathBuf,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_file_path(Path::new(path))
    }

    pub fn from_file_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file \"{}\"", path.display()))?;
        let mut raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing configuration file \"{}\"", path.display()))?;
        raw.apply_env_overrides();
        let mut config = raw.validate()?;
        config.source_path = path.to_path_buf();
        Ok(config)
    }

    pub fn dcs_path(&self) -> String {
        format!("{}/{}", self.namespace, self.scope)
    }
}

impl RawConfig {
    /// Environment variables override file values for the handful of fields
    /// operators most often need to vary per-container: `KEEPERED_SCOPE`,
    /// `KEEPERED_NAME`, `KEEPERED_NAMESPACE`, `KEEPERED_CONNECT_ADDRESS`,
    /// `KEEPERED_LOG_LEVEL`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KEEPERED_SCOPE") {
            self.scope = Some(v);
        }
        if let Ok(v) = std::env::var("KEEPERED_NAME") {
            self.name = Some(v);
        }
        if let Ok(v) = std::env::var("KEEPERED_NAMESPACE") {
            self.namespace = v;
        }
        if let Ok(v) = std::env::var("KEEPERED_CONNECT_ADDRESS") {
            self.connect_address = v;
        }
        if let Ok(v) = std::env::var("KEEPERED_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}
