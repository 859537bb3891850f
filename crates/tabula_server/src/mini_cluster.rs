//! A whole cluster in one process, wired through [`LocalTransport`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tabula_client::rpc::{ReplicaLocation, ReplicaRole, TabletLocationEntry};
use tabula_client::{Client, ClientConfig, Schema, Value};

use crate::master::{Catalog, Master};
use crate::scanner_registry::ScannerRegistryConfig;
use crate::tablet::Tablet;
use crate::tablet_server::TabletServer;
use crate::transport::LocalTransport;

#[derive(Clone, Debug)]
pub struct MiniClusterConfig {
    pub num_masters: usize,
    pub num_tablet_servers: usize,
    pub scanners: ScannerRegistryConfig,
}

impl Default for MiniClusterConfig {
    fn default() -> Self {
        Self {
            num_masters: 1,
            num_tablet_servers: 1,
            scanners: ScannerRegistryConfig::default(),
        }
    }
}

impl MiniClusterConfig {
    pub fn with_masters(mut self, num_masters: usize) -> Self {
        self.num_masters = num_masters;
        self
    }

    pub fn with_tablet_servers(mut self, num_tablet_servers: usize) -> Self {
        self.num_tablet_servers = num_tablet_servers;
        self
    }

    pub fn with_scanner_ttl(mut self, ttl: Duration, reap_interval: Duration) -> Self {
        self.scanners = ScannerRegistryConfig { ttl, reap_interval };
        self
    }
}

pub struct MiniCluster {
    transport: Arc<LocalTransport>,
    catalog: Arc<Catalog>,
    masters: Vec<Arc<Master>>,
    tablet_servers: Vec<Arc<TabletServer>>,
}

impl MiniCluster {
    /// Starts masters (the first one leads) and tablet servers.
    pub async fn start(cfg: MiniClusterConfig) -> anyhow::Result<Self> {
        if cfg.num_masters == 0 {
            anyhow::bail!("mini cluster requires at least one master");
        }
        if cfg.num_tablet_servers == 0 {
            anyhow::bail!("mini cluster requires at least one tablet server");
        }

        let transport = Arc::new(LocalTransport::new());
        let catalog = Arc::new(Catalog::new());
        let masters = (0..cfg.num_masters)
            .map(|idx| {
                let master = Master::new(
                    format!("master-{idx}"),
                    format!("127.0.0.1:{}", 7051 + idx * 10),
                    catalog.clone(),
                    idx == 0,
                );
                transport.register_master(&master);
                master
            })
            .collect::<Vec<_>>();
        let tablet_servers = (0..cfg.num_tablet_servers)
            .map(|idx| {
                let server = TabletServer::start(
                    format!("tserver-{idx}"),
                    format!("127.0.0.1:{}", 7050 + (idx + 1) * 1000),
                    cfg.scanners,
                );
                transport.register_tablet_server(&server);
                server
            })
            .collect::<Vec<_>>();

        tracing::info!(
            masters = masters.len(),
            tablet_servers = tablet_servers.len(),
            "mini cluster started"
        );
        Ok(Self {
            transport,
            catalog,
            masters,
            tablet_servers,
        })
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn master_addresses(&self) -> Vec<String> {
        self.masters.iter().map(|m| m.addr().to_string()).collect()
    }

    /// Client configuration pointing at every master of this cluster.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.master_addresses())
    }

    pub fn connect(&self) -> anyhow::Result<Client> {
        self.connect_with(self.client_config())
    }

    pub fn connect_with(&self, config: ClientConfig) -> anyhow::Result<Client> {
        Client::new(config, self.transport.clone()).context("failed to create client")
    }

    /// Creates a table split at `split_rows` (one key tuple per split point).
    pub fn create_table(&self, name: &str, schema: Schema, split_rows: &[Vec<Value>]) -> anyhow::Result<()> {
        self.create_table_with_visibility_delay(name, schema, split_rows, Duration::ZERO)
    }

    /// Like [`Self::create_table`], but masters report no tablets for the
    /// table until `delay` has passed.
    pub fn create_table_with_visibility_delay(
        &self,
        name: &str,
        schema: Schema,
        split_rows: &[Vec<Value>],
        delay: Duration,
    ) -> anyhow::Result<()> {
        if self.catalog.schema(name).is_some() {
            anyhow::bail!("failed to register table {name}: table already exists");
        }
        let schema = Arc::new(schema);
        let mut split_keys = split_rows
            .iter()
            .map(|row| schema.encode_key(row))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid split row for table {name}"))?;
        split_keys.sort();
        split_keys.dedup();

        let mut bounds = Vec::with_capacity(split_keys.len() + 2);
        bounds.push(Vec::new());
        bounds.extend(split_keys);
        bounds.push(Vec::new());

        let mut entries = Vec::with_capacity(bounds.len() - 1);
        for (idx, range) in bounds.windows(2).enumerate() {
            let server = &self.tablet_servers[idx % self.tablet_servers.len()];
            let tablet_id = format!("{name}-tablet-{idx}");
            server.add_tablet(Arc::new(Tablet::new(
                tablet_id.clone(),
                name,
                schema.clone(),
                range[0].clone(),
                range[1].clone(),
            )));
            entries.push(TabletLocationEntry {
                tablet_id,
                start_key: range[0].clone(),
                end_key: range[1].clone(),
                replicas: vec![ReplicaLocation {
                    server_uuid: server.uuid().to_string(),
                    addr: server.addr().to_string(),
                    role: ReplicaRole::Leader,
                }],
            });
        }

        let tablets = entries.len();
        self.catalog
            .add_table(name, schema, entries, delay)
            .with_context(|| format!("failed to register table {name}"))?;
        tracing::info!(table = name, tablets, "created table");
        Ok(())
    }

    pub fn master(&self, idx: usize) -> Option<&Arc<Master>> {
        self.masters.get(idx)
    }

    pub fn masters(&self) -> &[Arc<Master>] {
        &self.masters
    }

    pub fn tablet_server(&self, idx: usize) -> Option<&Arc<TabletServer>> {
        self.tablet_servers.get(idx)
    }

    pub fn tablet_servers(&self) -> &[Arc<TabletServer>] {
        &self.tablet_servers
    }

    pub fn leader_master_index(&self) -> Option<usize> {
        self.masters.iter().position(|m| m.is_leader())
    }

    /// Moves leadership to master `idx`.
    pub fn fail_over_master(&self, idx: usize) -> anyhow::Result<()> {
        if idx >= self.masters.len() {
            anyhow::bail!("no master with index {idx}");
        }
        for (i, master) in self.masters.iter().enumerate() {
            master.set_leader(i == idx);
        }
        tracing::info!(leader = %self.masters[idx].addr(), "master leadership moved");
        Ok(())
    }

    pub fn shutdown_master(&self, idx: usize) -> anyhow::Result<()> {
        self.masters
            .get(idx)
            .with_context(|| format!("no master with index {idx}"))?
            .shutdown();
        Ok(())
    }

    pub fn shutdown_tablet_server(&self, idx: usize) -> anyhow::Result<()> {
        self.tablet_servers
            .get(idx)
            .with_context(|| format!("no tablet server with index {idx}"))?
            .shutdown();
        Ok(())
    }

    pub fn count_active_scanners(&self) -> usize {
        self.tablet_servers
            .iter()
            .map(|ts| ts.count_active_scanners())
            .sum()
    }

    pub fn total_write_rpcs(&self) -> u64 {
        self.tablet_servers.iter().map(|ts| ts.stats().write_rpcs).sum()
    }

    pub fn shutdown(&self) {
        for server in &self.tablet_servers {
            server.shutdown();
        }
        for master in &self.masters {
            master.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_client::{ColumnSchema, DataType};

    fn schema() -> Schema {
        Schema::new(vec![ColumnSchema::new("key", DataType::UInt32)], 1).unwrap()
    }

    #[tokio::test]
    async fn split_rows_become_contiguous_tablets() -> anyhow::Result<()> {
        let cluster = MiniCluster::start(MiniClusterConfig::default().with_tablet_servers(2)).await?;
        cluster.create_table(
            "t",
            schema(),
            &[vec![Value::UInt32(200)], vec![Value::UInt32(100)]],
        )?;

        let hosted = cluster
            .tablet_servers()
            .iter()
            .map(|ts| (0..3).filter(|i| ts.tablet(&format!("t-tablet-{i}")).is_some()).count())
            .collect::<Vec<_>>();
        assert_eq!(hosted, vec![2, 1]);

        let err = cluster.create_table("t", schema(), &[]).expect_err("duplicate table");
        assert!(err.to_string().contains("failed to register table t"));
        Ok(())
    }

    #[tokio::test]
    async fn failover_moves_the_leader_flag() -> anyhow::Result<()> {
        let cluster = MiniCluster::start(MiniClusterConfig::default().with_masters(3)).await?;
        assert_eq!(cluster.leader_master_index(), Some(0));
        cluster.fail_over_master(2)?;
        assert_eq!(cluster.leader_master_index(), Some(2));
        assert!(cluster.fail_over_master(3).is_err());
        Ok(())
    }
}
