//! Client-side scan cursor over the tablets of one table.
//!
//! Tablets are visited in key order. The open call may return the whole
//! tablet at once, in which case the server keeps no scanner for it; otherwise
//! the returned scanner id is used for `scan_next` until the tablet reports no
//! more rows.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Result, Status};
use crate::meta_cache::RemoteTablet;
use crate::rpc::{ColumnRangePredicate, ScanRequest, ScanResponse, TabletServerService};
use crate::schema::Row;
use crate::table::Table;

pub struct Scanner {
    table: Table,
    projection: Vec<String>,
    predicates: Vec<ColumnRangePredicate>,
    batch_size_bytes: usize,
    state: ScanState,
}

enum ScanState {
    Unopened,
    Open(OpenScan),
    Closed,
}

struct OpenScan {
    remaining: VecDeque<RemoteTablet>,
    current: Option<ActiveTablet>,
    buffered: Vec<Row>,
}

struct ActiveTablet {
    tablet_id: String,
    addr: String,
    proxy: Arc<dyn TabletServerService>,
    scanner_id: Option<String>,
}

impl ActiveTablet {
    fn has_more(&self) -> bool {
        self.scanner_id.is_some()
    }
}

impl Scanner {
    pub(crate) fn new(table: Table) -> Self {
        let projection = table
            .schema()
            .columns()
            .iter()
            .map(|column| column.name.clone())
            .collect();
        let batch_size_bytes = table.client().config().scanner_batch_size_bytes;
        Self {
            table,
            projection,
            predicates: Vec::new(),
            batch_size_bytes,
            state: ScanState::Unopened,
        }
    }

    pub fn projection(&self) -> &[String] {
        &self.projection
    }

    /// Selects the returned columns. An empty list yields count-only rows.
    pub fn set_projection(&mut self, columns: &[&str]) -> Result<()> {
        self.ensure_unopened()?;
        let schema = self.table.schema();
        for column in columns {
            if schema.find_column(column).is_none() {
                return Err(Status::invalid_argument(format!(
                    "unknown column in projection: {column}"
                )));
            }
        }
        self.projection = columns.iter().map(|c| c.to_string()).collect();
        Ok(())
    }

    pub fn add_conjunct_predicate(&mut self, predicate: ColumnRangePredicate) -> Result<()> {
        self.ensure_unopened()?;
        let schema = self.table.schema();
        let idx = schema.find_column(&predicate.column).ok_or_else(|| {
            Status::invalid_argument(format!(
                "unknown column in predicate: {}",
                predicate.column
            ))
        })?;
        let expected = schema.columns()[idx].data_type;
        for bound in [&predicate.lower_bound, &predicate.upper_bound]
            .into_iter()
            .flatten()
        {
            if bound.data_type() != expected {
                return Err(Status::invalid_argument(format!(
                    "predicate on {} expects {}, got {}",
                    predicate.column,
                    expected.name(),
                    bound.data_type().name()
                )));
            }
        }
        self.predicates.push(predicate);
        Ok(())
    }

    /// Response budget. Zero makes the open call return no rows.
    pub fn set_batch_size_bytes(&mut self, batch_size_bytes: usize) -> Result<()> {
        self.ensure_unopened()?;
        self.batch_size_bytes = batch_size_bytes;
        Ok(())
    }

    pub async fn open(&mut self) -> Result<()> {
        self.ensure_unopened()?;
        let client = self.table.client().clone();
        let locations = client
            .locate_table(self.table.name(), client.resolution_deadline())
            .await?;
        self.state = ScanState::Open(OpenScan {
            remaining: locations.tablets().iter().cloned().collect(),
            current: None,
            buffered: Vec::new(),
        });
        self.open_next_tablet(self.batch_size_bytes).await?;
        Ok(())
    }

    pub fn has_more_rows(&self) -> bool {
        match &self.state {
            ScanState::Open(scan) => {
                !scan.buffered.is_empty()
                    || scan.current.as_ref().is_some_and(ActiveTablet::has_more)
                    || !scan.remaining.is_empty()
            }
            ScanState::Unopened | ScanState::Closed => false,
        }
    }

    /// Next rows in key order. May be empty while `has_more_rows` is true.
    pub async fn next_batch(&mut self) -> Result<Vec<Row>> {
        let budget = self.batch_size_bytes.max(1);
        let ScanState::Open(scan) = &mut self.state else {
            return Err(Status::illegal_state("scanner is not open"));
        };
        if !scan.buffered.is_empty() {
            return Ok(std::mem::take(&mut scan.buffered));
        }

        if let Some(active) = scan.current.as_mut() {
            if let Some(scanner_id) = active.scanner_id.clone() {
                let timeout = self.table.client().config().rpc_timeout();
                let response = match tokio::time::timeout(
                    timeout,
                    active.proxy.scan_next(&scanner_id, budget),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(Status::network_error(format!(
                            "scan of tablet {} at {} timed out after {} ms",
                            active.tablet_id,
                            active.addr,
                            timeout.as_millis()
                        )))
                    }
                };
                if !response.has_more {
                    active.scanner_id = None;
                }
                return Ok(response.rows);
            }
        }

        scan.current = None;
        self.open_next_tablet(budget).await?;
        match &mut self.state {
            ScanState::Open(scan) => Ok(std::mem::take(&mut scan.buffered)),
            _ => Ok(Vec::new()),
        }
    }

    /// Releases the server-side scanner. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ScanState::Closed);
        let ScanState::Open(scan) = state else {
            return Ok(());
        };
        let Some(active) = scan.current else {
            return Ok(());
        };
        let Some(scanner_id) = active.scanner_id else {
            return Ok(());
        };
        match active.proxy.scan_close(&scanner_id).await {
            Ok(()) => Ok(()),
            Err(Status::NotFound(_)) => Ok(()),
            Err(status) => Err(status),
        }
    }

    fn ensure_unopened(&self) -> Result<()> {
        match self.state {
            ScanState::Unopened => Ok(()),
            ScanState::Open(_) => Err(Status::illegal_state("scanner is already open")),
            ScanState::Closed => Err(Status::illegal_state("scanner is closed")),
        }
    }

    /// Opens remaining tablets until one yields rows or keeps a scanner.
    async fn open_next_tablet(&mut self, budget: usize) -> Result<()> {
        let client = self.table.client().clone();
        let timeout = client.config().rpc_timeout();
        loop {
            let ScanState::Open(scan) = &mut self.state else {
                return Ok(());
            };
            // Stays queued until its open succeeds; a retry reopens it.
            let Some(tablet) = scan.remaining.front().cloned() else {
                return Ok(());
            };
            let Some(leader) = tablet.leader() else {
                client.meta_cache().invalidate(self.table.name());
                return Err(Status::network_error(format!(
                    "no leader replica known for tablet {}",
                    tablet.tablet_id()
                )));
            };

            let proxy = client.transport().tablet_server(&leader.addr);
            let request = ScanRequest {
                tablet_id: tablet.tablet_id().to_string(),
                projection: self.projection.clone(),
                predicates: self.predicates.clone(),
                batch_size_bytes: budget,
            };
            let response: ScanResponse = match tokio::time::timeout(timeout, proxy.scan_open(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(status)) => {
                    if status.is_retriable_transport() {
                        client.meta_cache().invalidate(self.table.name());
                    }
                    return Err(status);
                }
                Err(_) => {
                    client.meta_cache().invalidate(self.table.name());
                    return Err(Status::network_error(format!(
                        "opening scan of tablet {} at {} timed out after {} ms",
                        tablet.tablet_id(),
                        leader.addr,
                        timeout.as_millis()
                    )))
                }
            };
            scan.remaining.pop_front();

            let scanner_id = response.scanner_id.filter(|_| response.has_more);
            if scanner_id.is_none() && response.rows.is_empty() {
                continue;
            }
            tracing::trace!(
                tablet = %tablet.tablet_id(),
                rows = response.rows.len(),
                scanner_id = ?scanner_id,
                "opened tablet scan"
            );
            scan.buffered = response.rows;
            scan.current = Some(ActiveTablet {
                tablet_id: tablet.tablet_id().to_string(),
                addr: leader.addr.clone(),
                proxy,
                scanner_id,
            });
            return Ok(());
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        let ScanState::Open(scan) = std::mem::replace(&mut self.state, ScanState::Closed) else {
            return;
        };
        let Some(ActiveTablet {
            proxy,
            scanner_id: Some(scanner_id),
            ..
        }) = scan.current
        else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(%scanner_id, "no runtime to close dropped scanner; server will expire it");
            return;
        };
        handle.spawn(async move {
            if let Err(err) = proxy.scan_close(&scanner_id).await {
                tracing::debug!(%scanner_id, error = %err, "closing dropped scanner failed");
            }
        });
    }
}
