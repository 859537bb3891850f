//! Server-side bookkeeping for open scanners.
//!
//! Each entry keeps the rows its scan has not returned yet plus a
//! last-activity instant. Entries go away on explicit close, when the scan is
//! exhausted, when the reaper finds them idle past the TTL, or when the
//! server clears the registry on shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tabula_client::{Result, Row, Status};

#[derive(Clone, Copy, Debug)]
pub struct ScannerRegistryConfig {
    /// Idle time after which a scanner is reaped.
    pub ttl: Duration,
    /// Reaper evaluation interval.
    pub reap_interval: Duration,
}

impl Default for ScannerRegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            reap_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct ScannerEntry {
    tablet_id: String,
    rows: VecDeque<Row>,
    last_access: Instant,
}

#[derive(Debug)]
pub struct ScannerRegistry {
    id_prefix: String,
    cfg: ScannerRegistryConfig,
    next_id: AtomicU64,
    scanners: Mutex<HashMap<String, ScannerEntry>>,
    reaped: AtomicU64,
}

impl ScannerRegistry {
    pub fn new(id_prefix: impl Into<String>, cfg: ScannerRegistryConfig) -> Self {
        Self {
            id_prefix: id_prefix.into(),
            cfg,
            next_id: AtomicU64::new(1),
            scanners: Mutex::new(HashMap::new()),
            reaped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> ScannerRegistryConfig {
        self.cfg
    }

    /// Registers the unread rows of a scan and returns the new scanner id.
    pub fn register(&self, tablet_id: &str, rows: VecDeque<Row>) -> String {
        let id = format!(
            "{}-{}",
            self.id_prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        if let Ok(mut scanners) = self.scanners.lock() {
            scanners.insert(
                id.clone(),
                ScannerEntry {
                    tablet_id: tablet_id.to_string(),
                    rows,
                    last_access: Instant::now(),
                },
            );
        }
        tracing::trace!(scanner_id = %id, tablet = tablet_id, "registered scanner");
        id
    }

    /// Returns the next batch and whether rows remain. An exhausted scanner
    /// is removed before returning.
    pub fn next_batch(&self, scanner_id: &str, budget: usize) -> Result<(Vec<Row>, bool)> {
        let mut scanners = self
            .scanners
            .lock()
            .map_err(|_| Status::illegal_state("scanner registry lock poisoned"))?;
        let Some(entry) = scanners.get_mut(scanner_id) else {
            return Err(Status::not_found(format!("scanner not found: {scanner_id}")));
        };
        entry.last_access = Instant::now();
        let batch = take_batch(&mut entry.rows, budget.max(1));
        let has_more = !entry.rows.is_empty();
        if !has_more {
            scanners.remove(scanner_id);
        }
        Ok((batch, has_more))
    }

    pub fn close(&self, scanner_id: &str) -> bool {
        self.scanners
            .lock()
            .map(|mut scanners| scanners.remove(scanner_id).is_some())
            .unwrap_or(false)
    }

    pub fn count_active_scanners(&self) -> usize {
        self.scanners.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Total scanners removed by the idle reaper.
    pub fn reaped_total(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    /// Drops every scanner idle for at least the TTL as of `now`.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let Ok(mut scanners) = self.scanners.lock() else {
            return 0;
        };
        let before = scanners.len();
        let ttl = self.cfg.ttl;
        scanners.retain(|id, entry| {
            let keep = now.saturating_duration_since(entry.last_access) < ttl;
            if !keep {
                tracing::debug!(scanner_id = %id, tablet = %entry.tablet_id, "expiring idle scanner");
            }
            keep
        });
        let removed = before - scanners.len();
        self.reaped.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        if let Ok(mut scanners) = self.scanners.lock() {
            scanners.clear();
        }
    }
}

/// Starts the idle reaper. It holds a weak reference and exits once the
/// registry is dropped.
pub fn spawn_reaper(registry: &Arc<ScannerRegistry>) {
    let weak: Weak<ScannerRegistry> = Arc::downgrade(registry);
    let interval = registry.cfg.reap_interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(registry) = weak.upgrade() else {
                break;
            };
            let removed = registry.reap_expired(Instant::now());
            if removed > 0 {
                tracing::info!(
                    removed,
                    remaining = registry.count_active_scanners(),
                    "reaped idle scanners"
                );
            }
        }
    });
}

/// Pops rows until `budget` bytes are used. Takes at least one row when any
/// remain; rows without payload count as one byte.
pub fn take_batch(rows: &mut VecDeque<Row>, budget: usize) -> Vec<Row> {
    let mut used = 0usize;
    let mut batch = Vec::new();
    while let Some(row) = rows.front() {
        let size = row.size_in_bytes().max(1);
        if !batch.is_empty() && used.saturating_add(size) > budget {
            break;
        }
        used = used.saturating_add(size);
        if let Some(row) = rows.pop_front() {
            batch.push(row);
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_client::Value;

    fn rows(n: u32) -> VecDeque<Row> {
        (0..n).map(|i| Row::new(vec![Some(Value::UInt32(i))])).collect()
    }

    fn registry(ttl: Duration) -> ScannerRegistry {
        ScannerRegistry::new(
            "ts-0",
            ScannerRegistryConfig {
                ttl,
                reap_interval: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn batches_respect_budget_and_exhaustion_removes_scanner() {
        let registry = registry(Duration::from_secs(60));
        let id = registry.register("tablet-1", rows(5));
        assert_eq!(registry.count_active_scanners(), 1);

        let (batch, more) = registry.next_batch(&id, 8).expect("first batch");
        assert_eq!(batch.len(), 2);
        assert!(more);

        let (batch, more) = registry.next_batch(&id, 1024).expect("rest");
        assert_eq!(batch.len(), 3);
        assert!(!more);
        assert_eq!(registry.count_active_scanners(), 0);

        let err = registry.next_batch(&id, 1).expect_err("gone");
        assert!(matches!(err, Status::NotFound(_)));
        assert!(err.to_string().contains("scanner not found"));
    }

    #[test]
    fn tiny_budget_still_makes_progress() {
        let mut pending = rows(3);
        assert_eq!(take_batch(&mut pending, 1).len(), 1);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn reap_only_removes_idle_scanners() {
        let registry = registry(Duration::from_millis(50));
        let idle = registry.register("t", rows(3));
        let later = Instant::now() + Duration::from_millis(100);
        let busy = registry.register("t", rows(3));
        registry.scanners.lock().unwrap().get_mut(&busy).unwrap().last_access = later;

        assert_eq!(registry.reap_expired(later), 1);
        assert!(registry.next_batch(&idle, 1).is_err());
        assert!(registry.next_batch(&busy, 1).is_ok());
        assert_eq!(registry.reaped_total(), 1);
    }

    #[tokio::test]
    async fn reaper_task_expires_abandoned_scanners() {
        let registry = Arc::new(registry(Duration::from_millis(20)));
        spawn_reaper(&registry);
        registry.register("t", rows(2));

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.count_active_scanners() > 0 {
            assert!(Instant::now() < deadline, "scanner was never reaped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
