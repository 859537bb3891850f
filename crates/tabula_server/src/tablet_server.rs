//! In-process tablet server hosting tablets and their scanners.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tabula_client::rpc::{
    PerRowError, ScanRequest, ScanResponse, TabletServerService, WriteRequest, WriteResponse,
};
use tabula_client::{Result, Status};

use crate::scanner_registry::{spawn_reaper, take_batch, ScannerRegistry, ScannerRegistryConfig};
use crate::tablet::Tablet;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TabletServerStats {
    pub write_rpcs: u64,
    pub rows_written: u64,
    pub scan_rpcs: u64,
}

pub struct TabletServer {
    uuid: String,
    addr: String,
    tablets: RwLock<HashMap<String, Arc<Tablet>>>,
    scanners: Arc<ScannerRegistry>,
    running: AtomicBool,
    unresponsive: AtomicBool,
    write_rpcs: AtomicU64,
    rows_written: AtomicU64,
    scan_rpcs: AtomicU64,
}

impl TabletServer {
    /// Creates a running server and starts its scanner reaper.
    pub fn start(uuid: impl Into<String>, addr: impl Into<String>, scanners: ScannerRegistryConfig) -> Arc<Self> {
        let uuid = uuid.into();
        let registry = Arc::new(ScannerRegistry::new(uuid.clone(), scanners));
        spawn_reaper(&registry);
        Arc::new(Self {
            uuid,
            addr: addr.into(),
            tablets: RwLock::new(HashMap::new()),
            scanners: registry,
            running: AtomicBool::new(true),
            unresponsive: AtomicBool::new(false),
            write_rpcs: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            scan_rpcs: AtomicU64::new(0),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn add_tablet(&self, tablet: Arc<Tablet>) {
        if let Ok(mut tablets) = self.tablets.write() {
            tablets.insert(tablet.tablet_id().to_string(), tablet);
        }
    }

    pub fn tablet(&self, tablet_id: &str) -> Option<Arc<Tablet>> {
        self.tablets
            .read()
            .ok()
            .and_then(|tablets| tablets.get(tablet_id).cloned())
    }

    pub fn scanner_registry(&self) -> &Arc<ScannerRegistry> {
        &self.scanners
    }

    pub fn count_active_scanners(&self) -> usize {
        self.scanners.count_active_scanners()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops answering RPCs and drops every open scanner. Tablet data is kept
    /// so a restart serves the same rows.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.scanners.clear();
            tracing::info!(uuid = %self.uuid, addr = %self.addr, "tablet server stopped");
        }
    }

    pub fn restart(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::info!(uuid = %self.uuid, addr = %self.addr, "tablet server restarted");
        }
    }

    /// An unresponsive server accepts RPCs but never answers them.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::Release);
    }

    pub fn stats(&self) -> TabletServerStats {
        TabletServerStats {
            write_rpcs: self.write_rpcs.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            scan_rpcs: self.scan_rpcs.load(Ordering::Relaxed),
        }
    }

    async fn admit(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Status::network_error(format!(
                "connection to {} refused",
                self.addr
            )));
        }
        if self.unresponsive.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn hosted_tablet(&self, tablet_id: &str) -> Result<Arc<Tablet>> {
        self.tablet(tablet_id).ok_or_else(|| {
            Status::not_found(format!("tablet {tablet_id} not hosted on {}", self.uuid))
        })
    }
}

#[async_trait]
impl TabletServerService for TabletServer {
    async fn write(&self, req: WriteRequest) -> Result<WriteResponse> {
        self.admit().await?;
        self.write_rpcs.fetch_add(1, Ordering::Relaxed);
        let tablet = self.hosted_tablet(&req.tablet_id)?;

        let mut per_row_errors = Vec::new();
        let mut applied = 0u64;
        for (row_index, op) in req.ops.iter().enumerate() {
            match tablet.apply(op) {
                Ok(()) => applied += 1,
                Err(status) => per_row_errors.push(PerRowError { row_index, status }),
            }
        }
        self.rows_written.fetch_add(applied, Ordering::Relaxed);
        if !per_row_errors.is_empty() {
            tracing::debug!(
                tablet = %req.tablet_id,
                failed = per_row_errors.len(),
                applied,
                "write batch had row errors"
            );
        }
        Ok(WriteResponse { per_row_errors })
    }

    async fn scan_open(&self, req: ScanRequest) -> Result<ScanResponse> {
        self.admit().await?;
        self.scan_rpcs.fetch_add(1, Ordering::Relaxed);
        let tablet = self.hosted_tablet(&req.tablet_id)?;
        let mut rows = VecDeque::from(tablet.scan(&req.projection, &req.predicates)?);

        // A zero budget only registers the scan.
        if req.batch_size_bytes == 0 {
            let scanner_id = self.scanners.register(&req.tablet_id, rows);
            return Ok(ScanResponse {
                scanner_id: Some(scanner_id),
                rows: Vec::new(),
                has_more: true,
            });
        }

        let batch = take_batch(&mut rows, req.batch_size_bytes);
        if rows.is_empty() {
            return Ok(ScanResponse {
                scanner_id: None,
                rows: batch,
                has_more: false,
            });
        }
        let scanner_id = self.scanners.register(&req.tablet_id, rows);
        Ok(ScanResponse {
            scanner_id: Some(scanner_id),
            rows: batch,
            has_more: true,
        })
    }

    async fn scan_next(&self, scanner_id: &str, batch_size_bytes: usize) -> Result<ScanResponse> {
        self.admit().await?;
        self.scan_rpcs.fetch_add(1, Ordering::Relaxed);
        let (rows, has_more) = self.scanners.next_batch(scanner_id, batch_size_bytes)?;
        Ok(ScanResponse {
            scanner_id: has_more.then(|| scanner_id.to_string()),
            rows,
            has_more,
        })
    }

    async fn scan_close(&self, scanner_id: &str) -> Result<()> {
        self.admit().await?;
        if self.scanners.close(scanner_id) {
            Ok(())
        } else {
            Err(Status::not_found(format!("scanner not found: {scanner_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_client::rpc::RowOperation;
    use tabula_client::{ColumnSchema, DataType, OperationKind, Schema, Value};

    fn server_with_rows(n: u32) -> Arc<TabletServer> {
        let server = TabletServer::start("ts-0", "127.0.0.1:7050", ScannerRegistryConfig::default());
        let schema = Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("int_val", DataType::UInt32),
            ],
            1,
        )
        .unwrap();
        let tablet = Arc::new(Tablet::new("tablet-0", "t", Arc::new(schema), Vec::new(), Vec::new()));
        for key in 0..n {
            tablet
                .apply(&RowOperation {
                    kind: OperationKind::Insert,
                    cells: vec![
                        ("key".into(), Value::UInt32(key)),
                        ("int_val".into(), Value::UInt32(key)),
                    ],
                })
                .unwrap();
        }
        server.add_tablet(tablet);
        server
    }

    fn scan_request(batch_size_bytes: usize) -> ScanRequest {
        ScanRequest {
            tablet_id: "tablet-0".into(),
            projection: vec!["key".into()],
            predicates: Vec::new(),
            batch_size_bytes,
        }
    }

    #[tokio::test]
    async fn small_result_registers_no_scanner() {
        let server = server_with_rows(10);
        let resp = server.scan_open(scan_request(1 << 20)).await.unwrap();
        assert_eq!(resp.rows.len(), 10);
        assert!(resp.scanner_id.is_none());
        assert_eq!(server.count_active_scanners(), 0);
    }

    #[tokio::test]
    async fn zero_budget_registers_and_close_releases() {
        let server = server_with_rows(10);
        let resp = server.scan_open(scan_request(0)).await.unwrap();
        assert!(resp.rows.is_empty());
        let scanner_id = resp.scanner_id.expect("scanner id");
        assert_eq!(server.count_active_scanners(), 1);

        server.scan_close(&scanner_id).await.unwrap();
        assert_eq!(server.count_active_scanners(), 0);
        let err = server.scan_next(&scanner_id, 1024).await.expect_err("closed");
        assert!(matches!(err, Status::NotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_refuses_rpcs_and_clears_scanners() {
        let server = server_with_rows(3);
        server.scan_open(scan_request(0)).await.unwrap();
        server.shutdown();
        assert_eq!(server.count_active_scanners(), 0);
        let err = server.scan_open(scan_request(0)).await.expect_err("down");
        assert!(matches!(err, Status::NetworkError(_)));

        server.restart();
        assert!(server.scan_open(scan_request(1024)).await.is_ok());
    }
}
