//! Bounded store of per-operation failures produced by flush rounds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use crate::error::Status;
use crate::operation::WriteOperation;

/// A failed operation together with the status the server or transport
/// reported for it.
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    op: WriteOperation,
    status: Status,
}

impl ErrorRecord {
    pub fn new(op: WriteOperation, status: Status) -> Self {
        Self { op, status }
    }

    pub fn failed_op(&self) -> &WriteOperation {
        &self.op
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Hands the operation back, e.g. to re-apply it after fixing the row.
    pub fn into_failed_op(self) -> WriteOperation {
        self.op
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.status)
    }
}

/// Records drained by [`ErrorCollector::get_pending_errors`].
#[derive(Debug, Default)]
pub struct PendingErrors {
    pub errors: Vec<ErrorRecord>,
    /// True if records were discarded since the previous drain.
    pub overflowed: bool,
}

#[derive(Debug, Default)]
struct CollectorState {
    records: VecDeque<ErrorRecord>,
    overflowed: bool,
}

/// Fixed-capacity FIFO. When full, the oldest record is discarded.
#[derive(Debug)]
pub struct ErrorCollector {
    capacity: usize,
    state: Mutex<CollectorState>,
}

impl ErrorCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CollectorState::default()),
        }
    }

    pub fn add_error(&self, record: ErrorRecord) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.records.len() >= self.capacity {
            if let Some(dropped) = state.records.pop_front() {
                tracing::debug!(
                    op = %dropped.failed_op(),
                    capacity = self.capacity,
                    "error collector full, discarding oldest record"
                );
            }
            state.overflowed = true;
        }
        state.records.push_back(record);
    }

    pub fn count_errors(&self) -> usize {
        self.state.lock().map(|state| state.records.len()).unwrap_or(0)
    }

    /// Removes up to `max` records, oldest first. The overflow flag is
    /// reported and cleared.
    pub fn get_pending_errors(&self, max: usize) -> PendingErrors {
        let Ok(mut state) = self.state.lock() else {
            return PendingErrors::default();
        };
        let take = max.min(state.records.len());
        let errors = state.records.drain(..take).collect();
        let overflowed = std::mem::take(&mut state.overflowed);
        PendingErrors { errors, overflowed }
    }
}
