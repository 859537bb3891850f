//! Write sessions: buffering, per-tablet batching and flush rounds.
//!
//! A flush round takes the whole buffer in one `std::mem::take`, resolves each
//! distinct table once, groups operations by destination tablet and sends one
//! batch per tablet as its own task. Every batch task holds the round's
//! [`FlushTracker`]; when the last one finishes the tracker is dropped and the
//! completion callback runs exactly once. Rounds never reference the session
//! itself, so dropping a session does not cancel or orphan a flush.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{info_span, Instrument};

use crate::client::Client;
use crate::error::{Result, Status};
use crate::error_collector::{ErrorCollector, ErrorRecord, PendingErrors};
use crate::meta_cache::RemoteTablet;
use crate::operation::WriteOperation;
use crate::rpc::{RowOperation, WriteRequest};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FlushMode {
    /// Operations accumulate until `flush` or `flush_async`.
    #[default]
    Manual,
    /// Every `apply` sends its operation and waits for the outcome.
    AutoFlushSync,
    /// Size thresholds and a periodic ticker flush in the background.
    AutoFlushBackground,
}

/// Completion callback for [`WriteSession::flush_async`].
pub type FlushCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Failure of [`WriteSession::apply`].
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The operation never entered the buffer; it is handed back unchanged.
    #[error("{status}")]
    Rejected {
        status: Status,
        op: Box<WriteOperation>,
    },
    /// The operation was sent (auto-flush sync) and its round failed.
    #[error("{0}")]
    Flush(Status),
}

impl ApplyError {
    pub fn status(&self) -> &Status {
        match self {
            ApplyError::Rejected { status, .. } => status,
            ApplyError::Flush(status) => status,
        }
    }

    /// The rejected operation, if it was not consumed.
    pub fn into_operation(self) -> Option<WriteOperation> {
        match self {
            ApplyError::Rejected { op, .. } => Some(*op),
            ApplyError::Flush(_) => None,
        }
    }
}

impl From<ApplyError> for Status {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Rejected { status, .. } => status,
            ApplyError::Flush(status) => status,
        }
    }
}

/// Buffers operations and flushes them to tablet servers.
pub struct WriteSession {
    state: Arc<SessionState>,
}

#[derive(Default)]
struct Buffer {
    ops: Vec<WriteOperation>,
    bytes: usize,
}

struct SessionState {
    client: Client,
    mode: Mutex<FlushMode>,
    buffer: Mutex<Buffer>,
    errors: Arc<ErrorCollector>,
    in_flight: Arc<InFlight>,
    write_timeout: Mutex<Option<Duration>>,
    ticker_started: AtomicBool,
    closed: AtomicBool,
}

impl WriteSession {
    pub(crate) fn new(client: Client) -> Self {
        let errors = Arc::new(ErrorCollector::new(client.config().error_collector_capacity));
        Self {
            state: Arc::new(SessionState {
                client,
                mode: Mutex::new(FlushMode::Manual),
                buffer: Mutex::new(Buffer::default()),
                errors,
                in_flight: Arc::new(InFlight::default()),
                write_timeout: Mutex::new(None),
                ticker_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.state.flush_mode()
    }

    /// Changes the flush mode. Fails while operations are buffered.
    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<()> {
        let buffer = self.state.lock_buffer()?;
        if !buffer.ops.is_empty() {
            return Err(Status::illegal_state(format!(
                "cannot change flush mode while {} operations are buffered",
                buffer.ops.len()
            )));
        }
        let mut current = self
            .state
            .mode
            .lock()
            .map_err(|_| Status::illegal_state("session flush mode lock poisoned"))?;
        *current = mode;
        Ok(())
    }

    /// Overrides the per-batch write RPC timeout for this session.
    pub fn set_timeout(&self, timeout: Duration) {
        if let Ok(mut slot) = self.state.write_timeout.lock() {
            *slot = Some(timeout);
        }
    }

    /// Buffers `op`, or in auto-flush-sync mode sends it and waits.
    pub async fn apply(&self, op: WriteOperation) -> std::result::Result<(), ApplyError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(ApplyError::Rejected {
                status: Status::illegal_state("session is closed"),
                op: Box::new(op),
            });
        }
        if !op.row().is_key_set() {
            return Err(ApplyError::Rejected {
                status: Status::illegal_state(format!("Key not specified: {op}")),
                op: Box::new(op),
            });
        }

        match self.state.flush_mode() {
            FlushMode::Manual => {
                self.state.push(op).map_err(ApplyError::Flush)?;
                Ok(())
            }
            FlushMode::AutoFlushSync => self
                .state
                .run_round_and_wait(vec![op])
                .await
                .map_err(ApplyError::Flush),
            FlushMode::AutoFlushBackground => {
                let (ops, bytes) = self.state.push(op).map_err(ApplyError::Flush)?;
                let config = self.state.client.config();
                if ops >= config.auto_flush_max_buffered_ops
                    || bytes >= config.auto_flush_max_buffered_bytes
                {
                    self.state.flush_in_background();
                }
                SessionState::ensure_background_ticker(&self.state);
                Ok(())
            }
        }
    }

    /// Flushes the buffer and waits for this round and any rounds already
    /// in flight. Returns the outcome of this call's own round.
    pub async fn flush(&self) -> Result<()> {
        let ops = self.state.take_buffer();
        let result = if ops.is_empty() {
            Ok(())
        } else {
            self.state.run_round_and_wait(ops).await
        };
        self.state.in_flight.wait_idle().await;
        result
    }

    /// Starts a flush round and returns immediately. `callback` runs exactly
    /// once with the round's outcome, even if the session is dropped first.
    pub fn flush_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let ops = self.state.take_buffer();
        if ops.is_empty() {
            callback(Ok(()));
            return;
        }
        self.state.dispatch_round(ops, Box::new(callback));
    }

    pub fn has_pending_operations(&self) -> bool {
        self.count_buffered_operations() > 0
    }

    pub fn count_buffered_operations(&self) -> usize {
        self.state
            .buffer
            .lock()
            .map(|buffer| buffer.ops.len())
            .unwrap_or(0)
    }

    /// Number of flush rounds that have not completed yet.
    pub fn count_in_flight_flushes(&self) -> usize {
        self.state.in_flight.count()
    }

    pub fn count_pending_errors(&self) -> usize {
        self.state.errors.count_errors()
    }

    pub fn get_pending_errors(&self, max: usize) -> PendingErrors {
        self.state.errors.get_pending_errors(max)
    }

    /// Closes the session. Fails while operations are still buffered.
    pub fn close(&self) -> Result<()> {
        let buffered = self.count_buffered_operations();
        if buffered > 0 {
            return Err(Status::illegal_state(format!(
                "cannot close session with {buffered} pending operations"
            )));
        }
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl SessionState {
    fn flush_mode(&self) -> FlushMode {
        self.mode.lock().map(|mode| *mode).unwrap_or_default()
    }

    fn lock_buffer(&self) -> Result<std::sync::MutexGuard<'_, Buffer>> {
        self.buffer
            .lock()
            .map_err(|_| Status::illegal_state("session buffer lock poisoned"))
    }

    /// Appends `op` and returns the buffer's new op count and byte size.
    fn push(&self, op: WriteOperation) -> Result<(usize, usize)> {
        let mut buffer = self.lock_buffer()?;
        buffer.bytes = buffer.bytes.saturating_add(op.size_in_bytes());
        buffer.ops.push(op);
        Ok((buffer.ops.len(), buffer.bytes))
    }

    fn take_buffer(&self) -> Vec<WriteOperation> {
        match self.buffer.lock() {
            Ok(mut buffer) => {
                buffer.bytes = 0;
                std::mem::take(&mut buffer.ops)
            }
            Err(_) => Vec::new(),
        }
    }

    fn write_timeout(&self) -> Duration {
        self.write_timeout
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or_else(|| self.client.config().rpc_timeout())
    }

    async fn run_round_and_wait(&self, ops: Vec<WriteOperation>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch_round(
            ops,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await
            .unwrap_or_else(|_| Err(Status::illegal_state("flush round ended without reporting")))
    }

    fn dispatch_round(&self, ops: Vec<WriteOperation>, callback: FlushCallback) {
        let tracker = Arc::new(FlushTracker::new(
            self.errors.clone(),
            self.in_flight.clone(),
            callback,
        ));
        let round = FlushRound {
            client: self.client.clone(),
            write_timeout: self.write_timeout(),
        };
        tokio::spawn(round.run(ops, tracker));
    }

    fn flush_in_background(&self) {
        let ops = self.take_buffer();
        if ops.is_empty() {
            return;
        }
        tracing::debug!(ops = ops.len(), "starting background flush");
        self.dispatch_round(
            ops,
            Box::new(|result| {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "background flush completed with errors");
                }
            }),
        );
    }

    fn ensure_background_ticker(state: &Arc<Self>) {
        if state.ticker_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(state);
        let period = state.client.config().background_flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                if state.flush_mode() != FlushMode::AutoFlushBackground {
                    state.ticker_started.store(false, Ordering::Release);
                    break;
                }
                state.flush_in_background();
            }
        });
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        let buffered = self.buffer.get_mut().map(|b| b.ops.len()).unwrap_or(0);
        if buffered > 0 {
            tracing::warn!(
                buffered,
                "write session dropped with buffered operations; they were never flushed"
            );
        }
    }
}

/// Count of outstanding rounds plus a wakeup for waiters on zero.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Shared completion context of one flush round.
struct FlushTracker {
    errors: Arc<ErrorCollector>,
    failed: AtomicUsize,
    in_flight: Arc<InFlight>,
    callback: Mutex<Option<FlushCallback>>,
}

impl FlushTracker {
    fn new(errors: Arc<ErrorCollector>, in_flight: Arc<InFlight>, callback: FlushCallback) -> Self {
        in_flight.begin();
        Self {
            errors,
            failed: AtomicUsize::new(0),
            in_flight,
            callback: Mutex::new(Some(callback)),
        }
    }

    fn record(&self, op: WriteOperation, status: Status) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.errors.add_error(ErrorRecord::new(op, status));
    }

    fn fail_all(&self, ops: Vec<WriteOperation>, status: &Status) {
        for op in ops {
            self.record(op, status.clone());
        }
    }
}

impl Drop for FlushTracker {
    fn drop(&mut self) {
        let failed = *self.failed.get_mut();
        self.in_flight.end();
        let callback = self.callback.get_mut().ok().and_then(Option::take);
        if let Some(callback) = callback {
            let result = if failed == 0 {
                Ok(())
            } else {
                Err(Status::Aggregate { failed })
            };
            callback(result);
        }
    }
}

/// Operations bound for one tablet in one round.
struct Batch {
    table_name: String,
    tablet: RemoteTablet,
    ops: Vec<WriteOperation>,
}

struct FlushRound {
    client: Client,
    write_timeout: Duration,
}

impl FlushRound {
    async fn run(self, ops: Vec<WriteOperation>, tracker: Arc<FlushTracker>) {
        let mut by_table: BTreeMap<String, Vec<WriteOperation>> = BTreeMap::new();
        for op in ops {
            by_table
                .entry(op.table().name().to_string())
                .or_default()
                .push(op);
        }

        let deadline = self.client.resolution_deadline();
        for (table_name, table_ops) in by_table {
            let locations = match self.client.locate_table(&table_name, deadline).await {
                Ok(locations) => locations,
                Err(status) => {
                    tracing::warn!(
                        table = %table_name,
                        ops = table_ops.len(),
                        error = %status,
                        "failed to resolve tablet locations"
                    );
                    tracker.fail_all(table_ops, &status);
                    continue;
                }
            };

            let mut batches: BTreeMap<String, Batch> = BTreeMap::new();
            for op in table_ops {
                let Some(key) = op.row().encoded_key() else {
                    let status = Status::illegal_state(format!("Key not specified: {op}"));
                    tracker.record(op, status);
                    continue;
                };
                match locations.tablet_for_key(&key) {
                    Some(tablet) => batches
                        .entry(tablet.tablet_id().to_string())
                        .or_insert_with(|| Batch {
                            table_name: table_name.clone(),
                            tablet: tablet.clone(),
                            ops: Vec::new(),
                        })
                        .ops
                        .push(op),
                    None => {
                        let status = Status::not_found(format!(
                            "no tablet of table {table_name} covers the key of {op}"
                        ));
                        tracker.record(op, status);
                    }
                }
            }

            let batch_count = batches.len();
            for (batch_idx, batch) in batches.into_values().enumerate() {
                let span = info_span!(
                    "tabula_client.write_batch",
                    table = %batch.table_name,
                    tablet = %batch.tablet.tablet_id(),
                    ops = batch.ops.len(),
                    batch_index = batch_idx + 1,
                    batch_count = batch_count
                );
                let client = self.client.clone();
                let tracker = tracker.clone();
                let timeout = self.write_timeout;
                tokio::spawn(send_batch(client, batch, timeout, tracker).instrument(span));
            }
        }
    }
}

async fn send_batch(client: Client, batch: Batch, timeout: Duration, tracker: Arc<FlushTracker>) {
    let Batch {
        table_name,
        tablet,
        ops,
    } = batch;

    let Some(leader) = tablet.leader() else {
        client.meta_cache().invalidate(&table_name);
        let status = Status::network_error(format!(
            "no leader replica known for tablet {}",
            tablet.tablet_id()
        ));
        tracker.fail_all(ops, &status);
        return;
    };

    let request = WriteRequest {
        tablet_id: tablet.tablet_id().to_string(),
        ops: ops
            .iter()
            .map(|op| RowOperation {
                kind: op.kind(),
                cells: op.row().cells(),
            })
            .collect(),
    };
    let proxy = client.transport().tablet_server(&leader.addr);

    let response = match tokio::time::timeout(timeout, proxy.write(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(status)) => {
            tracing::warn!(
                target_addr = %leader.addr,
                error = %status,
                "write batch failed; invalidating cached locations"
            );
            client.meta_cache().invalidate(&table_name);
            tracker.fail_all(ops, &status);
            return;
        }
        Err(_) => {
            let status = Status::network_error(format!(
                "write to tablet {} at {} timed out after {} ms",
                tablet.tablet_id(),
                leader.addr,
                timeout.as_millis()
            ));
            tracing::warn!(
                target_addr = %leader.addr,
                error = %status,
                "write batch timed out; invalidating cached locations"
            );
            client.meta_cache().invalidate(&table_name);
            tracker.fail_all(ops, &status);
            return;
        }
    };

    if response.per_row_errors.is_empty() {
        return;
    }
    let mut slots = ops.into_iter().map(Some).collect::<Vec<_>>();
    for row_error in response.per_row_errors {
        match slots.get_mut(row_error.row_index).and_then(Option::take) {
            Some(op) => tracker.record(op, row_error.status),
            None => tracing::warn!(
                row_index = row_error.row_index,
                "tablet server reported an error for an unknown row index"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::detached_table;

    #[tokio::test]
    async fn missing_key_is_rejected_and_operation_returned() {
        let table = detached_table("client-testtb");
        let session = table.client().new_session();
        let mut insert = table.new_insert();
        insert.mutable_row().set_u32("int_val", 54321).unwrap();
        insert.mutable_row().set_string("string_val", "hello world").unwrap();

        let err = session.apply(insert).await.expect_err("missing key");
        assert_eq!(
            err.status().to_string(),
            "Illegal state: Key not specified: INSERT uint32 int_val=54321, string string_val=hello world"
        );
        assert!(!session.has_pending_operations());

        let mut insert = err.into_operation().expect("operation handed back");
        insert.mutable_row().set_u32("key", 12345).unwrap();
        session.apply(insert).await.expect("apply with key");
        assert_eq!(session.count_buffered_operations(), 1);
    }

    #[tokio::test]
    async fn empty_flush_succeeds_without_any_round() {
        let table = detached_table("t");
        let session = table.client().new_session();
        session.flush().await.expect("empty flush");
        assert_eq!(session.count_in_flight_flushes(), 0);

        let (tx, rx) = oneshot::channel();
        session.flush_async(move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.expect("callback"), Ok(()));
    }

    #[tokio::test]
    async fn mode_change_and_close_refuse_buffered_operations() {
        let table = detached_table("t");
        let session = table.client().new_session();
        let mut insert = table.new_insert();
        insert.mutable_row().set_u32("key", 1).unwrap();
        session.apply(insert).await.expect("buffered");

        assert!(matches!(
            session.set_flush_mode(FlushMode::AutoFlushSync),
            Err(Status::IllegalState(_))
        ));
        assert!(matches!(session.close(), Err(Status::IllegalState(_))));
        assert_eq!(session.flush_mode(), FlushMode::Manual);
    }

    #[tokio::test]
    async fn closed_session_rejects_new_operations() {
        let table = detached_table("t");
        let session = table.client().new_session();
        session.close().expect("close empty session");

        let mut insert = table.new_insert();
        insert.mutable_row().set_u32("key", 1).unwrap();
        let err = session.apply(insert).await.expect_err("closed");
        assert!(matches!(err, ApplyError::Rejected { .. }));
    }
}
