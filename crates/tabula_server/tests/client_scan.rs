//! Scanner behavior against an in-process cluster.

mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use common::{insert_test_rows, scan_all, wait_for, TestHarness};
use tabula_client::{ColumnRangePredicate, ErrorKind, Status, Value};
use tabula_server::MiniClusterConfig;

const NUM_ROWS: u32 = 1000;

fn split_points() -> Vec<Vec<Value>> {
    vec![vec![Value::UInt32(300)], vec![Value::UInt32(700)]]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_returns_every_inserted_key() -> Result<()> {
    let harness = TestHarness::start().await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let mut scanner = harness.table.new_scanner();
    scanner.set_projection(&["key"])?;
    let rows = scan_all(scanner).await?;
    assert_eq!(rows.len(), NUM_ROWS as usize);

    let mut sum = 0u64;
    for row in &rows {
        sum += u64::from(row.get_u32(0)?);
    }
    let n = u64::from(NUM_ROWS);
    assert_eq!(sum, n * (n - 1) / 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_batches_walk_every_tablet_in_key_order() -> Result<()> {
    let harness = TestHarness::start_with(
        MiniClusterConfig::default().with_tablet_servers(2),
        &split_points(),
        |config| config.scanner_batch_size_bytes = 256,
    )
    .await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let mut scanner = harness.table.new_scanner();
    scanner.set_projection(&["key"])?;
    scanner.open().await?;
    let mut keys = Vec::new();
    let mut batches = 0;
    while scanner.has_more_rows() {
        let batch = scanner.next_batch().await?;
        batches += 1;
        for row in batch {
            keys.push(row.get_u32(0)?);
        }
    }
    scanner.close().await?;

    assert!(batches > 3, "expected several batches, got {batches}");
    assert_eq!(keys, (0..NUM_ROWS).collect::<Vec<_>>());
    assert_eq!(harness.cluster.count_active_scanners(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn string_range_predicate_selects_inclusive_subset() -> Result<()> {
    let harness = TestHarness::start().await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let lower = "hello 2";
    let upper = "hello 3";
    let mut scanner = harness.table.new_scanner();
    scanner.set_projection(&["string_val"])?;
    scanner.add_conjunct_predicate(ColumnRangePredicate::new(
        "string_val",
        Some(Value::String(lower.to_string())),
        Some(Value::String(upper.to_string())),
    ))?;
    let rows = scan_all(scanner).await?;

    let in_range = |s: &str| s.starts_with("hello 2") || s == "hello 3";
    let expected = (0..NUM_ROWS)
        .map(|i| format!("hello {i}"))
        .filter(|s| in_range(s.as_str()))
        .count();
    assert_eq!(rows.len(), expected);
    for row in &rows {
        let s = row.get_string(0)?;
        assert!(in_range(s), "{s} outside [{lower}, {upper}]");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_tablet_open_is_retried_after_restart() -> Result<()> {
    let harness = TestHarness::start_with(
        MiniClusterConfig::default().with_tablet_servers(2),
        &split_points(),
        |_| {},
    )
    .await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let mut scanner = harness.table.new_scanner();
    scanner.set_projection(&["key"])?;
    harness.cluster.shutdown_tablet_server(0)?;
    let err = scanner.open().await.expect_err("first tablet is down");
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert!(scanner.has_more_rows());

    harness
        .cluster
        .tablet_server(0)
        .context("tablet server 0")?
        .restart();
    let mut keys = Vec::new();
    while scanner.has_more_rows() {
        for row in scanner.next_batch().await? {
            keys.push(row.get_u32(0)?);
        }
    }
    scanner.close().await?;

    assert_eq!(keys, (0..NUM_ROWS).collect::<Vec<_>>());
    let sum = keys.iter().map(|&k| u64::from(k)).sum::<u64>();
    let n = u64::from(NUM_ROWS);
    assert_eq!(sum, n * (n - 1) / 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_table_has_no_rows() -> Result<()> {
    let harness = TestHarness::start_with(MiniClusterConfig::default(), &split_points(), |_| {}).await?;
    let mut scanner = harness.table.new_scanner();
    scanner.open().await?;
    assert!(!scanner.has_more_rows());
    scanner.close().await?;
    assert_eq!(harness.cluster.count_active_scanners(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_column_projection_counts_rows() -> Result<()> {
    let harness = TestHarness::start_with(MiniClusterConfig::default(), &split_points(), |_| {}).await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let mut scanner = harness.table.new_scanner();
    scanner.set_projection(&[])?;
    assert!(scanner.projection().is_empty());
    let rows = scan_all(scanner).await?;
    assert_eq!(rows.len(), NUM_ROWS as usize);
    assert!(rows.iter().all(|row| row.is_empty()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_close_releases_the_server_scanner() -> Result<()> {
    let harness = TestHarness::start().await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let mut scanner = harness.table.new_scanner();
    scanner.set_batch_size_bytes(0)?;
    scanner.open().await?;
    assert!(scanner.has_more_rows());
    assert_eq!(harness.cluster.count_active_scanners(), 1);

    scanner.close().await?;
    assert_eq!(harness.cluster.count_active_scanners(), 0);
    scanner.close().await.context("second close is a no-op")?;
    assert!(!scanner.has_more_rows());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_an_open_scanner_releases_it() -> Result<()> {
    let harness = TestHarness::start().await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    {
        let mut scanner = harness.table.new_scanner();
        scanner.set_batch_size_bytes(0)?;
        scanner.open().await?;
        assert_eq!(harness.cluster.count_active_scanners(), 1);
    }

    let cluster = &harness.cluster;
    wait_for("dropped scanner to be closed", || async move {
        cluster.count_active_scanners() == 0
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_scanner_is_reaped_and_reported_missing() -> Result<()> {
    let harness = TestHarness::start_with(
        MiniClusterConfig::default()
            .with_scanner_ttl(Duration::from_millis(100), Duration::from_millis(20)),
        &[],
        |_| {},
    )
    .await?;
    insert_test_rows(&harness.table, NUM_ROWS).await?;

    let mut scanner = harness.table.new_scanner();
    scanner.set_batch_size_bytes(0)?;
    scanner.open().await?;
    assert_eq!(harness.cluster.count_active_scanners(), 1);

    let cluster = &harness.cluster;
    wait_for("idle scanner to expire", || async move {
        cluster.count_active_scanners() == 0
    })
    .await?;

    let err = scanner.next_batch().await.expect_err("scanner expired");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("scanner not found"), "{err}");
    let reaped = cluster
        .tablet_server(0)
        .context("tablet server 0")?
        .scanner_registry()
        .reaped_total();
    assert_eq!(reaped, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_scan_configuration_is_rejected_up_front() -> Result<()> {
    let harness = TestHarness::start().await?;
    let mut scanner = harness.table.new_scanner();

    assert!(matches!(
        scanner.set_projection(&["key", "bad_col"]),
        Err(Status::InvalidArgument(_))
    ));
    assert!(matches!(
        scanner.add_conjunct_predicate(ColumnRangePredicate::new("bad_col", None, None)),
        Err(Status::InvalidArgument(_))
    ));
    assert!(matches!(
        scanner.add_conjunct_predicate(ColumnRangePredicate::new(
            "key",
            Some(Value::String("1".into())),
            None
        )),
        Err(Status::InvalidArgument(_))
    ));

    assert!(matches!(
        scanner.next_batch().await,
        Err(Status::IllegalState(_))
    ));
    scanner.open().await?;
    assert!(matches!(
        scanner.set_batch_size_bytes(1),
        Err(Status::IllegalState(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_against_dead_tablet_server_is_a_network_error() -> Result<()> {
    let harness = TestHarness::start().await?;
    insert_test_rows(&harness.table, 10).await?;
    harness.cluster.shutdown_tablet_server(0)?;

    let mut scanner = harness.table.new_scanner();
    let err = scanner.open().await.expect_err("server is down");
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    Ok(())
}
