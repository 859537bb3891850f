//! In-process cluster for tabula_client.
//!
//! Masters, tablet servers and the scanner registry here implement the RPC
//! traits from `tabula_client::rpc` directly. [`MiniCluster`] wires them
//! together through [`LocalTransport`] for tests and the workload driver.

pub mod master;
pub mod mini_cluster;
pub mod scanner_registry;
pub mod tablet;
pub mod tablet_server;
pub mod transport;

pub use master::{Catalog, Master};
pub use mini_cluster::{MiniCluster, MiniClusterConfig};
pub use scanner_registry::{ScannerRegistry, ScannerRegistryConfig};
pub use tablet::Tablet;
pub use tablet_server::{TabletServer, TabletServerStats};
pub use transport::LocalTransport;
