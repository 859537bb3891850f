//! In-process transport: addresses resolve to live server objects.
//!
//! Registrations hold weak references, so a dropped server behaves like a
//! closed port. Unknown or dead addresses hand out a proxy that fails every
//! call with `NetworkError`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tabula_client::rpc::{
    GetTableLocationsResponse, MasterRole, MasterService, ScanRequest, ScanResponse,
    TabletServerService, Transport, WriteRequest, WriteResponse,
};
use tabula_client::{Result, Status};

use crate::master::Master;
use crate::tablet_server::TabletServer;

#[derive(Default)]
pub struct LocalTransport {
    masters: RwLock<HashMap<String, Weak<Master>>>,
    tablet_servers: RwLock<HashMap<String, Weak<TabletServer>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_master(&self, master: &Arc<Master>) {
        if let Ok(mut masters) = self.masters.write() {
            masters.insert(master.addr().to_string(), Arc::downgrade(master));
        }
    }

    pub fn register_tablet_server(&self, server: &Arc<TabletServer>) {
        if let Ok(mut servers) = self.tablet_servers.write() {
            servers.insert(server.addr().to_string(), Arc::downgrade(server));
        }
    }

    pub fn unregister(&self, addr: &str) {
        if let Ok(mut masters) = self.masters.write() {
            masters.remove(addr);
        }
        if let Ok(mut servers) = self.tablet_servers.write() {
            servers.remove(addr);
        }
    }

    fn lookup<T>(registry: &RwLock<HashMap<String, Weak<T>>>, addr: &str) -> Option<Arc<T>> {
        let found = registry
            .read()
            .ok()
            .and_then(|entries| entries.get(addr).map(Weak::upgrade))?;
        if found.is_none() {
            // Drop the stale entry left behind by a server that went away.
            if let Ok(mut entries) = registry.write() {
                let stale = entries.get(addr).and_then(Weak::upgrade).is_none();
                if stale {
                    entries.remove(addr);
                }
            }
        }
        found
    }
}

impl Transport for LocalTransport {
    fn master(&self, addr: &str) -> Arc<dyn MasterService> {
        if let Some(master) = Self::lookup(&self.masters, addr) {
            return master;
        }
        Arc::new(Unreachable::new(addr))
    }

    fn tablet_server(&self, addr: &str) -> Arc<dyn TabletServerService> {
        if let Some(server) = Self::lookup(&self.tablet_servers, addr) {
            return server;
        }
        Arc::new(Unreachable::new(addr))
    }
}

/// Proxy for an address nothing is listening on.
struct Unreachable {
    addr: String,
}

impl Unreachable {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }

    fn refused(&self) -> Status {
        Status::network_error(format!("connection to {} refused", self.addr))
    }
}

#[async_trait]
impl MasterService for Unreachable {
    async fn get_table_locations(&self, _table_name: &str) -> Result<GetTableLocationsResponse> {
        Err(self.refused())
    }

    async fn get_master_registration(&self) -> Result<MasterRole> {
        Err(self.refused())
    }
}

#[async_trait]
impl TabletServerService for Unreachable {
    async fn write(&self, _req: WriteRequest) -> Result<WriteResponse> {
        Err(self.refused())
    }

    async fn scan_open(&self, _req: ScanRequest) -> Result<ScanResponse> {
        Err(self.refused())
    }

    async fn scan_next(&self, _scanner_id: &str, _batch_size_bytes: usize) -> Result<ScanResponse> {
        Err(self.refused())
    }

    async fn scan_close(&self, _scanner_id: &str) -> Result<()> {
        Err(self.refused())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::Catalog;

    #[tokio::test]
    async fn dropped_server_looks_like_a_closed_port() {
        let transport = LocalTransport::new();
        let master = Master::new("m-0", "127.0.0.1:7051", Arc::new(Catalog::new()), true);
        transport.register_master(&master);
        assert_eq!(
            transport.master("127.0.0.1:7051").get_master_registration().await,
            Ok(MasterRole::Leader)
        );

        drop(master);
        let err = transport
            .master("127.0.0.1:7051")
            .get_master_registration()
            .await
            .expect_err("gone");
        assert!(matches!(err, Status::NetworkError(_)));
        assert!(transport.masters.read().unwrap().is_empty());
    }
}
