//! Client entry point shared by tables, sessions and scanners.

use std::sync::Arc;

use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{Result, Status};
use crate::meta_cache::{MetaCache, TableLocations};
use crate::resolver::{MasterLeaderResolver, ResolverStatsSnapshot};
use crate::rpc::Transport;
use crate::schema::Schema;
use crate::session::WriteSession;
use crate::table::Table;

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    meta_cache: Arc<MetaCache>,
    resolver: MasterLeaderResolver,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let meta_cache = Arc::new(MetaCache::new());
        let resolver = MasterLeaderResolver::new(&config, transport.clone(), meta_cache.clone());
        tracing::debug!(masters = ?config.master_addresses, "client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                meta_cache,
                resolver,
            }),
        })
    }

    /// Opens a handle for `name` using the caller's view of its schema.
    ///
    /// No RPC is issued here; tablet locations are resolved lazily by the
    /// first flush or scan that needs them. Columns the server does not know
    /// are reported per row when written.
    pub fn open_table(&self, name: &str, schema: Schema) -> Result<Table> {
        if name.trim().is_empty() {
            return Err(Status::invalid_argument("table name must not be empty"));
        }
        if schema.num_key_columns() == 0 {
            return Err(Status::invalid_argument(format!(
                "schema for table {name} has no key columns"
            )));
        }
        Ok(Table::new(self.clone(), name.to_string(), schema))
    }

    pub fn new_session(&self) -> WriteSession {
        WriteSession::new(self.clone())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn meta_cache(&self) -> &Arc<MetaCache> {
        &self.inner.meta_cache
    }

    pub fn resolver_stats(&self) -> ResolverStatsSnapshot {
        self.inner.resolver.stats()
    }

    pub fn current_leader_master(&self) -> Option<String> {
        self.inner.resolver.current_leader()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Cached locations for `table_name`, resolving through the leader
    /// master on a miss.
    pub(crate) async fn locate_table(
        &self,
        table_name: &str,
        deadline: Instant,
    ) -> Result<Arc<TableLocations>> {
        if let Some(locations) = self.inner.meta_cache.lookup(table_name) {
            return Ok(locations);
        }
        self.inner
            .resolver
            .resolve_locations(table_name, deadline)
            .await
    }

    pub(crate) fn resolution_deadline(&self) -> Instant {
        Instant::now() + self.inner.config.metadata_resolution_timeout()
    }
}
