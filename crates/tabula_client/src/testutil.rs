//! Helpers for unit tests that need a table handle but no cluster.

use std::sync::Arc;

use async_trait::async_trait;

use crate::rpc::{
    GetTableLocationsResponse, MasterRole, MasterService, ScanRequest, ScanResponse,
    TabletServerService, Transport, WriteRequest, WriteResponse,
};
use crate::{Client, ClientConfig, ColumnSchema, DataType, Result, Schema, Status, Table};

/// Every endpoint refuses connections.
pub(crate) struct UnreachableTransport;

struct Unreachable;

#[async_trait]
impl MasterService for Unreachable {
    async fn get_table_locations(&self, _table_name: &str) -> Result<GetTableLocationsResponse> {
        Err(Status::network_error("connection refused"))
    }

    async fn get_master_registration(&self) -> Result<MasterRole> {
        Err(Status::network_error("connection refused"))
    }
}

#[async_trait]
impl TabletServerService for Unreachable {
    async fn write(&self, _req: WriteRequest) -> Result<WriteResponse> {
        Err(Status::network_error("connection refused"))
    }

    async fn scan_open(&self, _req: ScanRequest) -> Result<ScanResponse> {
        Err(Status::network_error("connection refused"))
    }

    async fn scan_next(&self, _scanner_id: &str, _batch_size_bytes: usize) -> Result<ScanResponse> {
        Err(Status::network_error("connection refused"))
    }

    async fn scan_close(&self, _scanner_id: &str) -> Result<()> {
        Err(Status::network_error("connection refused"))
    }
}

impl Transport for UnreachableTransport {
    fn master(&self, _addr: &str) -> Arc<dyn MasterService> {
        Arc::new(Unreachable)
    }

    fn tablet_server(&self, _addr: &str) -> Arc<dyn TabletServerService> {
        Arc::new(Unreachable)
    }
}

pub(crate) fn test_schema() -> Schema {
    Schema::new(
        vec![
            ColumnSchema::new("key", DataType::UInt32),
            ColumnSchema::new("int_val", DataType::UInt32),
            ColumnSchema::new("string_val", DataType::String).nullable(),
        ],
        1,
    )
    .expect("test schema")
}

/// Table handle on a client whose cluster cannot be reached.
pub(crate) fn detached_table(name: &str) -> Table {
    let client = Client::new(
        ClientConfig::new(["127.0.0.1:7051"]),
        Arc::new(UnreachableTransport),
    )
    .expect("client");
    client.open_table(name, test_schema()).expect("open table")
}
