//! Client access layer for a tablet-partitioned tabular store.
//!
//! Tables are split into tablets by primary-key range. The client learns where
//! tablets live from the leader master, caches those locations, and talks to
//! tablet servers directly: [`WriteSession`] batches row mutations per tablet
//! and [`Scanner`] walks tablets in key order. The wire is abstracted behind
//! the traits in [`rpc`], so a deployment plugs in its own [`rpc::Transport`].

pub mod client;
pub mod config;
pub mod error;
pub mod error_collector;
pub mod meta_cache;
pub mod operation;
pub mod resolver;
pub mod rpc;
pub mod scanner;
pub mod schema;
pub mod session;
pub mod table;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ErrorKind, Result, Status};
pub use error_collector::{ErrorCollector, ErrorRecord, PendingErrors};
pub use meta_cache::{MetaCache, RemoteTablet, TableLocations};
pub use operation::{OperationKind, WriteOperation};
pub use resolver::{MasterLeaderResolver, ResolverStatsSnapshot};
pub use rpc::ColumnRangePredicate;
pub use scanner::Scanner;
pub use schema::{ColumnSchema, DataType, PartialRow, Row, Schema, Value};
pub use session::{ApplyError, FlushCallback, FlushMode, WriteSession};
pub use table::Table;
