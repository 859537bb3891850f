//! Load generator for the tabula client.
//!
//! Starts an in-process cluster, drives concurrent write sessions against one
//! split table, verifies the result with a full scan and writes a JSON summary.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tabula_client::{
    ApplyError, ClientConfig, ColumnSchema, DataType, ErrorKind, FlushMode, ResolverStatsSnapshot,
    Schema, Table, Value, WriteSession,
};
use tabula_server::{MiniCluster, MiniClusterConfig, TabletServerStats};

const TABLE_NAME: &str = "workload";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "tabula-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for one workload run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of master replicas; the first one starts as leader.
    #[arg(long, env = "TABULA_WORKLOAD_MASTERS", default_value_t = 3)]
    masters: usize,

    #[arg(long, env = "TABULA_WORKLOAD_TABLET_SERVERS", default_value_t = 3)]
    tablet_servers: usize,

    /// Number of tablets the table is split into (evenly over the key space).
    #[arg(long, env = "TABULA_WORKLOAD_TABLETS", default_value_t = 4)]
    tablets: u32,

    /// Number of concurrent write sessions.
    #[arg(long, env = "TABULA_WORKLOAD_SESSIONS", default_value_t = 8)]
    sessions: u32,

    /// Rows written by each session. Keys never overlap between sessions.
    #[arg(long, env = "TABULA_WORKLOAD_ROWS_PER_SESSION", default_value_t = 10_000)]
    rows_per_session: u32,

    /// Flush every N applied rows in manual mode.
    #[arg(long, default_value_t = 500)]
    flush_every: u32,

    #[arg(long, value_enum, default_value_t = FlushModeArg::Manual)]
    flush_mode: FlushModeArg,

    /// Percent of rows re-inserted with an existing key, producing row errors.
    #[arg(long, default_value_t = 0)]
    duplicate_pct: u8,

    /// Per-session write timeout.
    #[arg(long, default_value = "10s")]
    write_timeout: humantime::Duration,

    /// Promote another master to leader this long after the run starts.
    #[arg(long)]
    failover_after: Option<humantime::Duration>,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optional JSON client config. Its master addresses are replaced by the cluster's.
    #[arg(long, env = "TABULA_CLIENT_CONFIG")]
    client_config: Option<PathBuf>,

    /// Write the JSON summary to this path.
    #[arg(long, default_value = ".tmp/tabula/workload.json")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
enum FlushModeArg {
    Manual,
    AutoSync,
    AutoBackground,
}

impl From<FlushModeArg> for FlushMode {
    fn from(mode: FlushModeArg) -> Self {
        match mode {
            FlushModeArg::Manual => FlushMode::Manual,
            FlushModeArg::AutoSync => FlushMode::AutoFlushSync,
            FlushModeArg::AutoBackground => FlushMode::AutoFlushBackground,
        }
    }
}

#[derive(Serialize, Debug)]
struct RunMeta {
    masters: usize,
    tablet_servers: usize,
    tablets: u32,
    sessions: u32,
    rows_per_session: u32,
    flush_mode: FlushModeArg,
    duplicate_pct: u8,
    seed: u64,
}

#[derive(Serialize, Debug, Default)]
struct SessionReport {
    session: u32,
    applied: u64,
    rejected: u64,
    failed: u64,
    /// Sum of `val` over rows that were not reported failed.
    committed_sum: u64,
    committed_rows: u64,
    errors_overflowed: bool,
    sample_errors: Vec<String>,
}

#[derive(Serialize, Debug)]
struct ServerReport {
    uuid: String,
    addr: String,
    #[serde(flatten)]
    stats: TabletServerStats,
}

#[derive(Serialize, Debug)]
struct Summary {
    meta: RunMeta,
    elapsed_ms: u64,
    rows_per_sec: f64,
    sessions: Vec<SessionReport>,
    scanned_rows: u64,
    scanned_sum: u64,
    verified: bool,
    leader_master: Option<String>,
    resolver: ResolverStatsSnapshot,
    tablet_servers: Vec<ServerReport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn workload_schema() -> anyhow::Result<Schema> {
    let schema = Schema::new(
        vec![
            ColumnSchema::new("key", DataType::UInt32),
            ColumnSchema::new("val", DataType::UInt32),
            ColumnSchema::new("payload", DataType::String).nullable(),
        ],
        1,
    )?;
    Ok(schema)
}

/// Evenly spaced split keys dividing `0..total_rows` into `tablets` ranges.
fn split_rows(total_rows: u32, tablets: u32) -> Vec<Vec<Value>> {
    let step = total_rows / tablets.max(1);
    if step == 0 {
        return Vec::new();
    }
    (1..tablets)
        .map(|idx| vec![Value::UInt32(idx * step)])
        .collect()
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.masters > 0, "--masters must be > 0");
    anyhow::ensure!(args.tablet_servers > 0, "--tablet-servers must be > 0");
    anyhow::ensure!(args.tablets > 0, "--tablets must be > 0");
    anyhow::ensure!(args.sessions > 0, "--sessions must be > 0");
    anyhow::ensure!(args.flush_every > 0, "--flush-every must be > 0");
    anyhow::ensure!(args.duplicate_pct <= 100, "--duplicate-pct must be <= 100");
    let total_rows = args
        .sessions
        .checked_mul(args.rows_per_session)
        .context("--sessions * --rows-per-session overflows the key space")?;

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let cluster = MiniCluster::start(
        MiniClusterConfig::default()
            .with_masters(args.masters)
            .with_tablet_servers(args.tablet_servers),
    )
    .await?;
    let schema = workload_schema()?;
    cluster.create_table(TABLE_NAME, schema.clone(), &split_rows(total_rows, args.tablets))?;

    let mut config = match &args.client_config {
        Some(path) => ClientConfig::load(path)?,
        None => cluster.client_config(),
    }
    .with_env_overrides();
    config.master_addresses = cluster.master_addresses();
    let client = cluster.connect_with(config)?;
    let table = client
        .open_table(TABLE_NAME, schema)
        .context("open workload table")?;

    tracing::info!(
        seed,
        sessions = args.sessions,
        rows = total_rows,
        tablets = args.tablets,
        "starting workload"
    );

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(args.sessions as usize);
    for session_id in 0..args.sessions {
        let table = table.clone();
        let args = args.clone();
        // Mix the base seed with the session id for deterministic per-session RNG.
        let seed = seed ^ u64::from(session_id).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_session(session_id, table, args, seed).await
        }));
    }

    if let Some(after) = args.failover_after {
        if args.masters > 1 {
            tokio::time::sleep(after.into()).await;
            let next = cluster.leader_master_index().map_or(1, |idx| (idx + 1) % args.masters);
            cluster.fail_over_master(next)?;
            tracing::info!(master = next, "forced master failover");
        } else {
            tracing::warn!("--failover-after needs more than one master, ignoring");
        }
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in tasks {
        reports.push(task.await.context("session task panicked")??);
    }
    let elapsed = started.elapsed();

    let (scanned_rows, scanned_sum) = scan_totals(&table).await.context("verification scan")?;
    let committed_rows: u64 = reports.iter().map(|r| r.committed_rows).sum();
    let committed_sum: u64 = reports.iter().map(|r| r.committed_sum).sum();
    let verified = scanned_rows == committed_rows && scanned_sum == committed_sum;
    if verified {
        tracing::info!(rows = scanned_rows, sum = scanned_sum, "scan matches committed rows");
    } else {
        tracing::error!(
            scanned_rows,
            committed_rows,
            scanned_sum,
            committed_sum,
            "scan does not match committed rows"
        );
    }

    let summary = Summary {
        meta: RunMeta {
            masters: args.masters,
            tablet_servers: args.tablet_servers,
            tablets: args.tablets,
            sessions: args.sessions,
            rows_per_session: args.rows_per_session,
            flush_mode: args.flush_mode,
            duplicate_pct: args.duplicate_pct,
            seed,
        },
        elapsed_ms: elapsed.as_millis() as u64,
        rows_per_sec: committed_rows as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        sessions: reports,
        scanned_rows,
        scanned_sum,
        verified,
        leader_master: client.current_leader_master(),
        resolver: client.resolver_stats(),
        tablet_servers: cluster
            .tablet_servers()
            .iter()
            .map(|server| ServerReport {
                uuid: server.uuid().to_string(),
                addr: server.addr().to_string(),
                stats: server.stats(),
            })
            .collect(),
    };
    write_summary(&args.out, &summary).context("write summary")?;
    eprintln!("wrote summary: {}", args.out.display());
    cluster.shutdown();

    anyhow::ensure!(verified, "scan does not match committed rows");
    Ok(())
}

/// Writes this session's disjoint key range in shuffled order.
async fn run_session(
    session_id: u32,
    table: Table,
    args: RunArgs,
    seed: u64,
) -> anyhow::Result<SessionReport> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let session = table.client().new_session();
    session.set_timeout(args.write_timeout.into());
    session.set_flush_mode(args.flush_mode.into())?;

    let base = session_id * args.rows_per_session;
    let mut keys: Vec<u32> = (base..base + args.rows_per_session).collect();
    keys.shuffle(&mut rng);

    let mut report = SessionReport {
        session: session_id,
        ..SessionReport::default()
    };
    // key -> val for every row handed to the session.
    let mut written = HashMap::with_capacity(keys.len());
    let mut since_flush = 0u32;

    for (idx, key) in keys.iter().copied().enumerate() {
        let val: u32 = rng.gen_range(0..1_000_000);
        insert(&session, &table, key, val, &mut report).await?;
        written.insert(key, val);

        let replay = idx > 0 && rng.gen_range(0..100u32) < u32::from(args.duplicate_pct);
        if replay {
            // Same value as the original, so whichever insert lands first is correct.
            let dup = keys[rng.gen_range(0..idx)];
            let dup_val = written.get(&dup).copied().unwrap_or(val);
            insert(&session, &table, dup, dup_val, &mut report).await?;
        }

        since_flush += 1;
        if args.flush_mode == FlushModeArg::Manual && since_flush >= args.flush_every {
            since_flush = 0;
            if let Err(err) = session.flush().await {
                tracing::debug!(session = session_id, error = %err, "flush reported failures");
            }
        }
    }
    if let Err(err) = session.flush().await {
        tracing::debug!(session = session_id, error = %err, "final flush reported failures");
    }

    let pending = session.get_pending_errors(usize::MAX);
    report.errors_overflowed = pending.overflowed;
    for record in pending.errors {
        report.failed += 1;
        if report.sample_errors.len() < 5 {
            report.sample_errors.push(record.to_string());
        }
        // Duplicate inserts fail with AlreadyPresent; the first write of the key stands.
        if record.status().kind() == ErrorKind::AlreadyPresent {
            continue;
        }
        let key = record
            .failed_op()
            .row()
            .get("key")
            .and_then(|value| match value {
                Value::UInt32(key) => Some(*key),
                _ => None,
            });
        if let Some(key) = key {
            written.remove(&key);
        }
    }

    report.committed_rows = written.len() as u64;
    report.committed_sum = written.values().map(|val| u64::from(*val)).sum();
    session.close()?;
    tracing::info!(
        session = session_id,
        applied = report.applied,
        failed = report.failed,
        "session finished"
    );
    Ok(report)
}

async fn insert(
    session: &WriteSession,
    table: &Table,
    key: u32,
    val: u32,
    report: &mut SessionReport,
) -> anyhow::Result<()> {
    let mut op = table.new_insert();
    let row = op.mutable_row();
    row.set_u32("key", key)?;
    row.set_u32("val", val)?;
    row.set_string("payload", format!("row {key}"))?;
    match session.apply(op).await {
        Ok(()) => report.applied += 1,
        // The row was sent and its outcome is in the error collector.
        Err(ApplyError::Flush(_)) => report.applied += 1,
        Err(ApplyError::Rejected { status, .. }) => {
            report.rejected += 1;
            anyhow::bail!("row {key} rejected: {status}");
        }
    }
    Ok(())
}

/// Row count and `val` sum over the whole table.
async fn scan_totals(table: &Table) -> anyhow::Result<(u64, u64)> {
    let mut scanner = table.new_scanner();
    scanner.set_projection(&["val"])?;
    scanner.open().await?;
    let (mut rows, mut sum) = (0u64, 0u64);
    while scanner.has_more_rows() {
        for row in scanner.next_batch().await? {
            rows += 1;
            sum += u64::from(row.get_u32(0)?);
        }
    }
    scanner.close().await?;
    Ok((rows, sum))
}

/// Serialize and write the run summary JSON.
fn write_summary(path: &Path, summary: &Summary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
