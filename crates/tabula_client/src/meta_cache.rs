//! Per-client cache of table → tablet → replica locations.
//!
//! Entries carry no freshness timestamp. A failed RPC against a cached
//! location invalidates the table's entry and the next lookup goes back to the
//! master. Concurrent resolutions for one table are allowed to race; the last
//! completed install wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::rpc::{ReplicaLocation, ReplicaRole, TabletLocationEntry};

/// One tablet with its key range and replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTablet {
    tablet_id: String,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    replicas: Vec<ReplicaLocation>,
}

impl RemoteTablet {
    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    pub fn end_key(&self) -> &[u8] {
        &self.end_key
    }

    pub fn replicas(&self) -> &[ReplicaLocation] {
        &self.replicas
    }

    /// The replica currently hinted as leader.
    pub fn leader(&self) -> Option<&ReplicaLocation> {
        self.replicas
            .iter()
            .find(|replica| replica.role == ReplicaRole::Leader)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start_key, &self.end_key)
    }
}

impl From<TabletLocationEntry> for RemoteTablet {
    fn from(entry: TabletLocationEntry) -> Self {
        Self {
            tablet_id: entry.tablet_id,
            start_key: entry.start_key,
            end_key: entry.end_key,
            replicas: entry.replicas,
        }
    }
}

/// All known tablets of one table, sorted by start key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableLocations {
    table_name: String,
    tablets: Vec<RemoteTablet>,
}

impl TableLocations {
    pub fn new(table_name: impl Into<String>, entries: Vec<TabletLocationEntry>) -> Self {
        let mut tablets = entries.into_iter().map(RemoteTablet::from).collect::<Vec<_>>();
        tablets.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        Self {
            table_name: table_name.into(),
            tablets,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn tablets(&self) -> &[RemoteTablet] {
        &self.tablets
    }

    /// Routes an encoded primary key to the tablet whose range contains it.
    pub fn tablet_for_key(&self, key: &[u8]) -> Option<&RemoteTablet> {
        self.tablets.iter().find(|tablet| tablet.contains_key(key))
    }
}

#[derive(Debug, Default)]
pub struct MetaCache {
    tables: RwLock<HashMap<String, Arc<TableLocations>>>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, table_name: &str) -> Option<Arc<TableLocations>> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table_name).cloned())
    }

    pub fn install(&self, locations: Arc<TableLocations>) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(locations.table_name().to_string(), locations);
        }
    }

    /// Drops a table's entry so the next lookup re-resolves it.
    pub fn invalidate(&self, table_name: &str) -> bool {
        self.tables
            .write()
            .map(|mut tables| tables.remove(table_name).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|tables| tables.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Checks whether `key` is within `[start, end)` where empty bounds are open.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    let in_start = start.is_empty() || key >= start;
    let in_end = end.is_empty() || key < end;
    in_start && in_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, start: &[u8], end: &[u8], leader: &str) -> TabletLocationEntry {
        TabletLocationEntry {
            tablet_id: id.to_string(),
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            replicas: vec![
                ReplicaLocation {
                    server_uuid: format!("{leader}-uuid"),
                    addr: leader.to_string(),
                    role: ReplicaRole::Leader,
                },
                ReplicaLocation {
                    server_uuid: "follower-uuid".to_string(),
                    addr: "follower:7050".to_string(),
                    role: ReplicaRole::Follower,
                },
            ],
        }
    }

    #[test]
    fn routes_keys_to_containing_range() {
        let locations = TableLocations::new(
            "t",
            vec![
                entry("right", b"m", b"", "ts-2:7050"),
                entry("left", b"", b"m", "ts-1:7050"),
            ],
        );
        assert_eq!(locations.tablets()[0].tablet_id(), "left");
        assert_eq!(
            locations.tablet_for_key(b"apple").map(RemoteTablet::tablet_id),
            Some("left")
        );
        assert_eq!(
            locations.tablet_for_key(b"m").map(RemoteTablet::tablet_id),
            Some("right")
        );
        let right = locations.tablet_for_key(b"zebra").expect("right tablet");
        assert_eq!(right.leader().map(|r| r.addr.as_str()), Some("ts-2:7050"));
    }

    #[test]
    fn gaps_in_the_keyspace_route_nowhere() {
        let locations = TableLocations::new("t", vec![entry("a", b"b", b"d", "ts:1")]);
        assert!(locations.tablet_for_key(b"a").is_none());
        assert!(locations.tablet_for_key(b"d").is_none());
        assert!(locations.tablet_for_key(b"c").is_some());
    }

    #[test]
    fn install_is_last_write_wins_and_invalidate_removes() {
        let cache = MetaCache::new();
        cache.install(Arc::new(TableLocations::new("t", vec![entry("a", b"", b"", "x:1")])));
        cache.install(Arc::new(TableLocations::new("t", vec![entry("b", b"", b"", "y:1")])));
        let cached = cache.lookup("t").expect("cached");
        assert_eq!(cached.tablets()[0].tablet_id(), "b");
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate("t"));
        assert!(!cache.invalidate("t"));
        assert!(cache.lookup("t").is_none());
        assert!(cache.is_empty());
    }
}
