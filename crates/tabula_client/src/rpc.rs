//! RPC contracts consumed by the client.
//!
//! The client never talks to a socket directly. It asks a [`Transport`] for a
//! proxy to a master or tablet server address and calls the async service
//! traits below. Concrete implementations can use gRPC, in-memory channels,
//! or test harnesses; transport failures surface as `Status::NetworkError`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, Status};
use crate::operation::OperationKind;
use crate::schema::{Row, Value};

/// Role a replica plays in its tablet's consensus group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub server_uuid: String,
    pub addr: String,
    pub role: ReplicaRole,
}

/// Tablet descriptor as reported by the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletLocationEntry {
    pub tablet_id: String,
    /// Inclusive encoded start key; empty means unbounded.
    pub start_key: Vec<u8>,
    /// Exclusive encoded end key; empty means unbounded.
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaLocation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterErrorCode {
    NotTheLeader,
    CatalogManagerNotInitialized,
    TableNotFound,
    UnknownError,
}

/// Application-level error carried inside a successful master response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterError {
    pub code: MasterErrorCode,
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetTableLocationsResponse {
    pub tablets: Vec<TabletLocationEntry>,
    pub error: Option<MasterError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterRole {
    Leader,
    Follower,
}

#[async_trait]
pub trait MasterService: Send + Sync + 'static {
    async fn get_table_locations(&self, table_name: &str) -> Result<GetTableLocationsResponse>;

    /// Leader probe used during leader rediscovery.
    async fn get_master_registration(&self) -> Result<MasterRole>;
}

/// One row mutation on the wire: column names with their values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowOperation {
    pub kind: OperationKind,
    pub cells: Vec<(String, Value)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub tablet_id: String,
    pub ops: Vec<RowOperation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerRowError {
    /// Index into `WriteRequest::ops`.
    pub row_index: usize,
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteResponse {
    pub per_row_errors: Vec<PerRowError>,
}

/// Inclusive range predicate on one column. Either bound may be open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRangePredicate {
    pub column: String,
    pub lower_bound: Option<Value>,
    pub upper_bound: Option<Value>,
}

impl ColumnRangePredicate {
    pub fn new(column: impl Into<String>, lower_bound: Option<Value>, upper_bound: Option<Value>) -> Self {
        Self {
            column: column.into(),
            lower_bound,
            upper_bound,
        }
    }

    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        let above = self.lower_bound.as_ref().map_or(true, |lower| value >= lower);
        let below = self.upper_bound.as_ref().map_or(true, |upper| value <= upper);
        above && below
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub tablet_id: String,
    /// Projected column names; empty requests row markers only.
    pub projection: Vec<String>,
    pub predicates: Vec<ColumnRangePredicate>,
    pub batch_size_bytes: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResponse {
    /// Set only when rows remain beyond this response.
    pub scanner_id: Option<String>,
    pub rows: Vec<Row>,
    pub has_more: bool,
}

#[async_trait]
pub trait TabletServerService: Send + Sync + 'static {
    async fn write(&self, req: WriteRequest) -> Result<WriteResponse>;

    async fn scan_open(&self, req: ScanRequest) -> Result<ScanResponse>;

    /// Fails with `Status::NotFound` once the scanner was closed or expired.
    async fn scan_next(&self, scanner_id: &str, batch_size_bytes: usize) -> Result<ScanResponse>;

    async fn scan_close(&self, scanner_id: &str) -> Result<()>;
}

/// Hands out proxies for remote endpoints.
pub trait Transport: Send + Sync + 'static {
    fn master(&self, addr: &str) -> Arc<dyn MasterService>;

    fn tablet_server(&self, addr: &str) -> Arc<dyn TabletServerService>;
}
