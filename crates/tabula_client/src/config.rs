//! Client configuration.
//!
//! All tunables are carried by an explicit [`ClientConfig`] handed to
//! [`crate::Client::new`]; nothing is read from process-global state after
//! construction. Values can come from code, a JSON file, or `TABULA_*`
//! environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, Status};

pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ADMIN_OPERATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_METADATA_RESOLUTION_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_MASTER_RPC_ATTEMPT_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_TABLE_NOT_VISIBLE_BACKOFF_MS: u64 = 100;
pub const DEFAULT_LEADER_PROBE_BACKOFF_MS: u64 = 50;
pub const DEFAULT_ERROR_COLLECTOR_CAPACITY: usize = 1_024;
pub const DEFAULT_AUTO_FLUSH_MAX_BUFFERED_OPS: usize = 1_000;
pub const DEFAULT_AUTO_FLUSH_MAX_BUFFERED_BYTES: usize = 7 * 1024 * 1024;
pub const DEFAULT_BACKGROUND_FLUSH_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_SCANNER_BATCH_SIZE_BYTES: usize = 1024 * 1024;

/// Client-wide settings shared by every session and scanner of one client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of every master replica. The leader is discovered at runtime.
    pub master_addresses: Vec<String>,
    /// Upper bound for one tablet-server RPC (write batch, scan call).
    pub default_rpc_timeout_ms: u64,
    /// Upper bound for administrative calls such as leader probes.
    pub default_admin_operation_timeout_ms: u64,
    /// Total budget for resolving a table's locations, retries included.
    pub metadata_resolution_timeout_ms: u64,
    /// Budget for a single metadata RPC attempt inside the resolution loop.
    pub master_rpc_attempt_timeout_ms: u64,
    /// Sleep between lookups while a table has no visible tablets yet.
    pub table_not_visible_backoff_ms: u64,
    /// Sleep after a leader probe round found no leader.
    pub leader_probe_backoff_ms: u64,
    /// Maximum number of error records a session retains.
    pub error_collector_capacity: usize,
    /// Buffered operation count that triggers a background flush.
    pub auto_flush_max_buffered_ops: usize,
    /// Buffered payload size that triggers a background flush.
    pub auto_flush_max_buffered_bytes: usize,
    /// Period of the background flusher in `AutoFlushBackground` mode.
    pub background_flush_interval_ms: u64,
    /// Default per-call row budget (in bytes) for scanners.
    pub scanner_batch_size_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_addresses: Vec::new(),
            default_rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            default_admin_operation_timeout_ms: DEFAULT_ADMIN_OPERATION_TIMEOUT_MS,
            metadata_resolution_timeout_ms: DEFAULT_METADATA_RESOLUTION_TIMEOUT_MS,
            master_rpc_attempt_timeout_ms: DEFAULT_MASTER_RPC_ATTEMPT_TIMEOUT_MS,
            table_not_visible_backoff_ms: DEFAULT_TABLE_NOT_VISIBLE_BACKOFF_MS,
            leader_probe_backoff_ms: DEFAULT_LEADER_PROBE_BACKOFF_MS,
            error_collector_capacity: DEFAULT_ERROR_COLLECTOR_CAPACITY,
            auto_flush_max_buffered_ops: DEFAULT_AUTO_FLUSH_MAX_BUFFERED_OPS,
            auto_flush_max_buffered_bytes: DEFAULT_AUTO_FLUSH_MAX_BUFFERED_BYTES,
            background_flush_interval_ms: DEFAULT_BACKGROUND_FLUSH_INTERVAL_MS,
            scanner_batch_size_bytes: DEFAULT_SCANNER_BATCH_SIZE_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn new<S: Into<String>>(master_addresses: impl IntoIterator<Item = S>) -> Self {
        Self {
            master_addresses: master_addresses.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read client config {}", path.display()))?;
        let config: ClientConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse client config {}", path.display()))?;
        config
            .validate()
            .map_err(|err| anyhow::anyhow!("invalid client config {}: {err}", path.display()))?;
        Ok(config)
    }

    /// Applies `TABULA_*` environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("TABULA_MASTER_ADDRESSES") {
            let addrs = parse_address_list(&raw);
            if !addrs.is_empty() {
                self.master_addresses = addrs;
            }
        }
        override_u64(&mut self.default_rpc_timeout_ms, "TABULA_RPC_TIMEOUT_MS");
        override_u64(
            &mut self.default_admin_operation_timeout_ms,
            "TABULA_ADMIN_OPERATION_TIMEOUT_MS",
        );
        override_u64(
            &mut self.metadata_resolution_timeout_ms,
            "TABULA_METADATA_RESOLUTION_TIMEOUT_MS",
        );
        override_u64(
            &mut self.master_rpc_attempt_timeout_ms,
            "TABULA_MASTER_RPC_ATTEMPT_TIMEOUT_MS",
        );
        override_u64(
            &mut self.table_not_visible_backoff_ms,
            "TABULA_TABLE_NOT_VISIBLE_BACKOFF_MS",
        );
        override_u64(&mut self.leader_probe_backoff_ms, "TABULA_LEADER_PROBE_BACKOFF_MS");
        override_usize(&mut self.error_collector_capacity, "TABULA_ERROR_COLLECTOR_CAPACITY");
        override_usize(
            &mut self.auto_flush_max_buffered_ops,
            "TABULA_AUTO_FLUSH_MAX_BUFFERED_OPS",
        );
        override_usize(
            &mut self.auto_flush_max_buffered_bytes,
            "TABULA_AUTO_FLUSH_MAX_BUFFERED_BYTES",
        );
        override_u64(
            &mut self.background_flush_interval_ms,
            "TABULA_BACKGROUND_FLUSH_INTERVAL_MS",
        );
        override_usize(&mut self.scanner_batch_size_bytes, "TABULA_SCANNER_BATCH_SIZE_BYTES");
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.master_addresses.is_empty() {
            return Err(Status::invalid_argument(
                "at least one master address is required",
            ));
        }
        if let Some(addr) = self.master_addresses.iter().find(|a| a.trim().is_empty()) {
            return Err(Status::invalid_argument(format!(
                "invalid master address {addr:?}"
            )));
        }
        if self.metadata_resolution_timeout_ms == 0 || self.master_rpc_attempt_timeout_ms == 0 {
            return Err(Status::invalid_argument(
                "metadata resolution timeouts must be > 0",
            ));
        }
        if self.default_rpc_timeout_ms == 0 {
            return Err(Status::invalid_argument("rpc timeout must be > 0"));
        }
        if self.error_collector_capacity == 0 {
            return Err(Status::invalid_argument(
                "error collector capacity must be > 0",
            ));
        }
        if self.auto_flush_max_buffered_ops == 0 || self.auto_flush_max_buffered_bytes == 0 {
            return Err(Status::invalid_argument("auto-flush thresholds must be > 0"));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.default_rpc_timeout_ms)
    }

    pub fn admin_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.default_admin_operation_timeout_ms)
    }

    pub fn metadata_resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_resolution_timeout_ms)
    }

    pub fn master_rpc_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.master_rpc_attempt_timeout_ms)
    }

    pub fn table_not_visible_backoff(&self) -> Duration {
        Duration::from_millis(self.table_not_visible_backoff_ms)
    }

    pub fn leader_probe_backoff(&self) -> Duration {
        Duration::from_millis(self.leader_probe_backoff_ms)
    }

    pub fn background_flush_interval(&self) -> Duration {
        Duration::from_millis(self.background_flush_interval_ms.max(1))
    }
}

fn parse_positive_env<T: std::str::FromStr + PartialOrd + Default>(var_name: &str) -> Option<T> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn override_u64(slot: &mut u64, var_name: &str) {
    if let Some(value) = parse_positive_env::<u64>(var_name) {
        *slot = value;
    }
}

fn override_usize(slot: &mut usize, var_name: &str) {
    if let Some(value) = parse_positive_env::<usize>(var_name) {
        *slot = value;
    }
}

/// Splits a comma-separated `host:port` list, dropping empty entries.
pub fn parse_address_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
