//! Shared helpers for client integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tabula_client::{
    Client, ClientConfig, ColumnSchema, DataType, ErrorRecord, Row, Scanner, Schema, Table,
    Value, WriteOperation, WriteSession,
};
use tabula_server::{MiniCluster, MiniClusterConfig};

pub const TABLE_NAME: &str = "client-testtb";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `key uint32, int_val uint32, string_val string NULL`, keyed on `key`.
pub fn test_schema() -> Schema {
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

/// A running cluster, a client, and one opened test table.
pub struct TestHarness {
    pub cluster: MiniCluster,
    pub client: Client,
    pub table: Table,
}

impl TestHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(MiniClusterConfig::default(), &[], |_| {}).await
    }

    pub async fn start_with(
        cfg: MiniClusterConfig,
        split_rows: &[Vec<Value>],
        tune: impl FnOnce(&mut ClientConfig),
    ) -> Result<Self> {
        init_tracing();
        let cluster = MiniCluster::start(cfg).await?;
        cluster.create_table(TABLE_NAME, test_schema(), split_rows)?;
        let mut config = fast_client_config(&cluster);
        tune(&mut config);
        let client = cluster.connect_with(config)?;
        let table = client
            .open_table(TABLE_NAME, test_schema())
            .context("open test table")?;
        Ok(Self {
            cluster,
            client,
            table,
        })
    }
}

/// Client config with short deadlines so failure paths finish quickly.
pub fn fast_client_config(cluster: &MiniCluster) -> ClientConfig {
    let mut config = cluster.client_config();
    config.metadata_resolution_timeout_ms = 5_000;
    config.master_rpc_attempt_timeout_ms = 500;
    config.table_not_visible_backoff_ms = 20;
    config.leader_probe_backoff_ms = 10;
    config.default_rpc_timeout_ms = 5_000;
    config
}

pub fn insert_op(table: &Table, key: u32, int_val: u32, string_val: &str) -> Result<WriteOperation> {
    let mut op = table.new_insert();
    let row = op.mutable_row();
    row.set_u32("key", key)?;
    row.set_u32("int_val", int_val)?;
    row.set_string("string_val", string_val)?;
    Ok(op)
}

/// Inserts rows `key = i, int_val = 2i, string_val = "hello i"` for `0..num_rows`.
pub async fn insert_test_rows(table: &Table, num_rows: u32) -> Result<()> {
    let session = table.client().new_session();
    for i in 0..num_rows {
        session
            .apply(insert_op(table, i, i * 2, &format!("hello {i}"))?)
            .await
            .map_err(|err| anyhow::anyhow!("apply row {i}: {err}"))?;
        if i % 1000 == 999 {
            session.flush().await.context("flush test rows")?;
        }
    }
    session.flush().await.context("flush test rows")?;
    assert_eq!(session.count_pending_errors(), 0);
    Ok(())
}

/// Opens `scanner` and collects every row.
pub async fn scan_all(mut scanner: Scanner) -> Result<Vec<Row>> {
    scanner.open().await.context("open scanner")?;
    let mut rows = Vec::new();
    while scanner.has_more_rows() {
        rows.extend(scanner.next_batch().await.context("next batch")?);
    }
    scanner.close().await.context("close scanner")?;
    Ok(rows)
}

pub fn drain_errors(session: &WriteSession) -> Vec<ErrorRecord> {
    let pending = session.get_pending_errors(usize::MAX);
    assert!(!pending.overflowed, "error collector overflowed");
    pending.errors
}

pub async fn wait_for<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
