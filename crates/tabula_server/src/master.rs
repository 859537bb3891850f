//! In-process masters sharing one catalog.
//!
//! Every master of a cluster reads the same [`Catalog`]; leadership, catalog
//! readiness and reachability are per-master switches so tests can stage
//! failovers, startup windows and hung RPCs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tabula_client::rpc::{
    GetTableLocationsResponse, MasterError, MasterErrorCode, MasterRole, MasterService,
    TabletLocationEntry,
};
use tabula_client::{Result, Schema, Status};

#[derive(Debug)]
struct CatalogTable {
    schema: Arc<Schema>,
    tablets: Vec<TabletLocationEntry>,
    /// Tablets are reported as empty until this instant.
    visible_at: Instant,
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, CatalogTable>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(
        &self,
        name: &str,
        schema: Arc<Schema>,
        tablets: Vec<TabletLocationEntry>,
        visibility_delay: Duration,
    ) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| Status::illegal_state("catalog lock poisoned"))?;
        if tables.contains_key(name) {
            return Err(Status::already_present(format!("table {name} already exists")));
        }
        tables.insert(
            name.to_string(),
            CatalogTable {
                schema,
                tablets,
                visible_at: Instant::now() + visibility_delay,
            },
        );
        Ok(())
    }

    pub fn schema(&self, name: &str) -> Option<Arc<Schema>> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(name).map(|t| t.schema.clone()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names = self
            .tables
            .read()
            .map(|tables| tables.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Currently reported tablets; `None` if the table does not exist.
    fn visible_tablets(&self, name: &str) -> Option<Vec<TabletLocationEntry>> {
        let tables = self.tables.read().ok()?;
        let table = tables.get(name)?;
        if Instant::now() < table.visible_at {
            Some(Vec::new())
        } else {
            Some(table.tablets.clone())
        }
    }
}

pub struct Master {
    uuid: String,
    addr: String,
    catalog: Arc<Catalog>,
    leader: AtomicBool,
    catalog_ready: AtomicBool,
    running: AtomicBool,
    unresponsive: AtomicBool,
    location_lookups: AtomicU64,
}

impl Master {
    pub fn new(uuid: impl Into<String>, addr: impl Into<String>, catalog: Arc<Catalog>, leader: bool) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            addr: addr.into(),
            catalog,
            leader: AtomicBool::new(leader),
            catalog_ready: AtomicBool::new(true),
            running: AtomicBool::new(true),
            unresponsive: AtomicBool::new(false),
            location_lookups: AtomicU64::new(0),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    pub fn set_catalog_ready(&self, ready: bool) {
        self.catalog_ready.store(ready, Ordering::Release);
    }

    /// An unresponsive master accepts RPCs but never answers them.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!(uuid = %self.uuid, addr = %self.addr, "master stopped");
        }
    }

    pub fn restart(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn location_lookups(&self) -> u64 {
        self.location_lookups.load(Ordering::Relaxed)
    }

    async fn admit(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Status::network_error(format!(
                "connection to master {} refused",
                self.addr
            )));
        }
        if self.unresponsive.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

fn master_error(code: MasterErrorCode, status: Status) -> GetTableLocationsResponse {
    GetTableLocationsResponse {
        tablets: Vec::new(),
        error: Some(MasterError { code, status }),
    }
}

#[async_trait]
impl MasterService for Master {
    async fn get_table_locations(&self, table_name: &str) -> Result<GetTableLocationsResponse> {
        self.admit().await?;
        self.location_lookups.fetch_add(1, Ordering::Relaxed);
        if !self.is_leader() {
            return Ok(master_error(
                MasterErrorCode::NotTheLeader,
                Status::illegal_state(format!("master {} is not the leader", self.uuid)),
            ));
        }
        if !self.catalog_ready.load(Ordering::Acquire) {
            return Ok(master_error(
                MasterErrorCode::CatalogManagerNotInitialized,
                Status::illegal_state("catalog manager is not yet initialized"),
            ));
        }
        match self.catalog.visible_tablets(table_name) {
            Some(tablets) => Ok(GetTableLocationsResponse {
                tablets,
                error: None,
            }),
            None => Ok(master_error(
                MasterErrorCode::TableNotFound,
                Status::not_found(format!("the table does not exist: {table_name}")),
            )),
        }
    }

    async fn get_master_registration(&self) -> Result<MasterRole> {
        self.admit().await?;
        Ok(if self.is_leader() {
            MasterRole::Leader
        } else {
            MasterRole::Follower
        })
    }
}
