//! Table-location resolution against the leader master.
//!
//! The resolver is a small state machine bounded by a deadline:
//! - `Lookup` asks the cached leader for the table's tablets;
//! - `Rediscover` probes every configured master for the leader role;
//! - `Backoff` sleeps before the next lookup.
//!
//! Transport failures, timed-out attempts and "not the leader"/"catalog not
//! initialized" answers go straight to `Rediscover`. Only a table with no
//! visible tablets yet, or a probe round that found no leader, sleeps. Any
//! other error is handed back to the caller unchanged, so for an unreachable
//! cluster the only terminal outcome is deadline expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{Result, Status};
use crate::meta_cache::{MetaCache, TableLocations};
use crate::rpc::{MasterErrorCode, MasterRole, TabletLocationEntry, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Lookup,
    Rediscover,
    Backoff(Duration),
}

/// Outcome of one metadata RPC attempt.
enum Attempt {
    Found(Vec<TabletLocationEntry>),
    NotVisible,
    Redirect(String),
    Failed(Status),
}

pub struct MasterLeaderResolver {
    master_addresses: Vec<String>,
    transport: Arc<dyn Transport>,
    cache: Arc<MetaCache>,
    leader: RwLock<Option<String>>,
    attempt_timeout: Duration,
    not_visible_backoff: Duration,
    leader_probe_backoff: Duration,
    stats: ResolverStats,
}

impl MasterLeaderResolver {
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>, cache: Arc<MetaCache>) -> Self {
        Self {
            master_addresses: config.master_addresses.clone(),
            transport,
            cache,
            leader: RwLock::new(None),
            attempt_timeout: config.master_rpc_attempt_timeout(),
            not_visible_backoff: config.table_not_visible_backoff(),
            leader_probe_backoff: config.leader_probe_backoff(),
            stats: ResolverStats::default(),
        }
    }

    /// Last master known to hold leadership.
    pub fn current_leader(&self) -> Option<String> {
        self.leader.read().ok().and_then(|leader| leader.clone())
    }

    pub fn stats(&self) -> ResolverStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolves `table_name` to a non-empty tablet list and installs it in the cache.
    pub async fn resolve_locations(
        &self,
        table_name: &str,
        deadline: Instant,
    ) -> Result<Arc<TableLocations>> {
        let started = Instant::now();
        self.stats.resolutions.fetch_add(1, Ordering::Relaxed);
        let mut step = if self.current_leader().is_some() {
            Step::Lookup
        } else {
            Step::Rediscover
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                let elapsed_ms = now.duration_since(started).as_millis() as u64;
                self.stats.deadline_expiries.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    table = table_name,
                    elapsed_ms,
                    "timed out waiting for non-empty table locations from a leader master"
                );
                return Err(Status::timed_out(format!(
                    "timed out waiting for non-empty table locations for {table_name} \
                     from a leader master after {elapsed_ms} ms"
                )));
            }
            let sub_timeout = self.attempt_timeout.min(deadline - now);

            step = match step {
                Step::Lookup => {
                    let Some(leader) = self.current_leader() else {
                        step = Step::Rediscover;
                        continue;
                    };
                    match self.attempt_lookup(&leader, table_name, sub_timeout).await {
                        Attempt::Found(tablets) => {
                            let locations = Arc::new(TableLocations::new(table_name, tablets));
                            self.cache.install(locations.clone());
                            tracing::debug!(
                                table = table_name,
                                tablets = locations.tablets().len(),
                                "resolved table locations"
                            );
                            return Ok(locations);
                        }
                        Attempt::NotVisible => {
                            self.stats.not_visible_backoffs.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                table = table_name,
                                "table has no visible tablets yet, backing off"
                            );
                            Step::Backoff(self.not_visible_backoff)
                        }
                        Attempt::Redirect(reason) => {
                            tracing::warn!(
                                master = %leader,
                                reason = %reason,
                                "determining the leader master again and retrying"
                            );
                            Step::Rediscover
                        }
                        Attempt::Failed(status) => return Err(status),
                    }
                }
                Step::Rediscover => match self.rediscover_leader(sub_timeout).await {
                    Ok(_) => Step::Lookup,
                    Err(status) => {
                        tracing::warn!(error = %status, "leader master rediscovery failed");
                        Step::Backoff(self.leader_probe_backoff)
                    }
                },
                Step::Backoff(delay) => {
                    tokio::time::sleep(delay.min(deadline - now)).await;
                    Step::Lookup
                }
            };
        }
    }

    async fn attempt_lookup(&self, leader: &str, table_name: &str, timeout: Duration) -> Attempt {
        self.stats.lookup_rpcs.fetch_add(1, Ordering::Relaxed);
        let proxy = self.transport.master(leader);
        let response = match tokio::time::timeout(timeout, proxy.get_table_locations(table_name)).await {
            Err(_) => {
                return Attempt::Redirect(format!(
                    "lookup timed out after {} ms",
                    timeout.as_millis()
                ))
            }
            Ok(Err(status)) if status.is_retriable_transport() => {
                return Attempt::Redirect(status.to_string())
            }
            Ok(Err(status)) => return Attempt::Failed(status),
            Ok(Ok(response)) => response,
        };

        match response.error {
            Some(error)
                if matches!(
                    error.code,
                    MasterErrorCode::NotTheLeader | MasterErrorCode::CatalogManagerNotInitialized
                ) =>
            {
                Attempt::Redirect(error.status.to_string())
            }
            Some(error) => Attempt::Failed(error.status),
            None if response.tablets.is_empty() => Attempt::NotVisible,
            None => Attempt::Found(response.tablets),
        }
    }

    /// Probes all masters and adopts the first one that answers as leader.
    async fn rediscover_leader(&self, timeout: Duration) -> Result<String> {
        self.stats.rediscoveries.fetch_add(1, Ordering::Relaxed);
        // Redirect loops never sleep; in-process transports may not yield either.
        tokio::task::yield_now().await;
        let mut probes = self
            .master_addresses
            .iter()
            .map(|addr| {
                let proxy = self.transport.master(addr);
                let addr = addr.clone();
                async move {
                    let outcome = tokio::time::timeout(timeout, proxy.get_master_registration()).await;
                    (addr, outcome)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut failures = Vec::new();
        while let Some((addr, outcome)) = probes.next().await {
            match outcome {
                Ok(Ok(MasterRole::Leader)) => {
                    if let Ok(mut leader) = self.leader.write() {
                        *leader = Some(addr.clone());
                    }
                    tracing::info!(master = %addr, "found leader master");
                    return Ok(addr);
                }
                Ok(Ok(MasterRole::Follower)) => failures.push(format!("{addr}: follower")),
                Ok(Err(status)) => failures.push(format!("{addr}: {status}")),
                Err(_) => failures.push(format!("{addr}: probe timed out")),
            }
        }

        if let Ok(mut leader) = self.leader.write() {
            *leader = None;
        }
        Err(Status::network_error(format!(
            "no leader master found among [{}]",
            failures.join("; ")
        )))
    }
}

#[derive(Debug, Default)]
pub struct ResolverStats {
    resolutions: AtomicU64,
    lookup_rpcs: AtomicU64,
    rediscoveries: AtomicU64,
    not_visible_backoffs: AtomicU64,
    deadline_expiries: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStatsSnapshot {
    pub resolutions: u64,
    pub lookup_rpcs: u64,
    pub rediscoveries: u64,
    pub not_visible_backoffs: u64,
    pub deadline_expiries: u64,
}

impl ResolverStats {
    fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            lookup_rpcs: self.lookup_rpcs.load(Ordering::Relaxed),
            rediscoveries: self.rediscoveries.load(Ordering::Relaxed),
            not_visible_backoffs: self.not_visible_backoffs.load(Ordering::Relaxed),
            deadline_expiries: self.deadline_expiries.load(Ordering::Relaxed),
        }
    }
}
