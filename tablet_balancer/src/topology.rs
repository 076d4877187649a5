use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tablet_api::{HostId, TableId, TabletMap};

/// Lifecycle state of a node as reported by the topology source. Only
/// `Normal` nodes participate in balancing.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize)]
pub enum NodeState {
    Normal,
    Joining,
    Leaving,
}

/// In-memory description of a node in the topology snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct Node {
    host: HostId,
    dc: String,
    rack: String,
    state: NodeState,
    shard_count: u32,
}

impl Node {
    pub fn new(host: HostId, dc: String, rack: String, state: NodeState, shard_count: u32) -> Self {
        Self {
            host,
            dc,
            rack,
            state,
            shard_count,
        }
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn dc(&self) -> &str {
        &self.dc
    }

    pub fn rack(&self) -> &str {
        &self.rack
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn is_normal(&self) -> bool {
        self.state == NodeState::Normal
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.host, self.dc, self.rack)
    }
}

/// Versioned, immutable snapshot of cluster topology and tablet placement.
///
/// One snapshot backs one planning call. Callers obtain a fresh snapshot from
/// the topology source before every round; the planner never observes
/// concurrent mutation.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    version: u64,
    nodes: HashMap<HostId, Node>,
    tables: BTreeMap<TableId, TabletMap>,
}

impl Topology {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            nodes: HashMap::new(),
            tables: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn node_upsert(&mut self, node: Node) {
        self.nodes.insert(node.host(), node);
    }

    pub fn table_upsert(&mut self, table: TableId, map: TabletMap) {
        self.tables.insert(table, map);
    }

    pub fn table_remove(&mut self, table: TableId) -> Option<TabletMap> {
        self.tables.remove(&table)
    }

    /// All datacenters present in the snapshot, in name order.
    pub fn datacenters(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.dc()).collect()
    }

    pub fn for_each_normal_node_in(&self, dc: &str, mut f: impl FnMut(&Node)) {
        for node in self.nodes.values() {
            if node.is_normal() && node.dc() == dc {
                f(node);
            }
        }
    }

    /// Look up a node that is known to exist. Replica lists and planner state
    /// only ever reference known hosts, so a miss is a programmer error.
    pub fn node(&self, host: HostId) -> &Node {
        self.nodes
            .get(&host)
            .expect("Referenced nodes always exist")
    }

    pub fn get_node(&self, host: HostId) -> Option<&Node> {
        self.nodes.get(&host)
    }

    /// All tables with their tablet maps, in table-id order.
    pub fn tables(&self) -> impl Iterator<Item = (TableId, &TabletMap)> {
        self.tables.iter().map(|(id, map)| (*id, map))
    }

    pub fn table(&self, table: TableId) -> &TabletMap {
        self.tables
            .get(&table)
            .expect("Referenced tables always exist")
    }

    pub fn table_mut(&mut self, table: TableId) -> Option<&mut TabletMap> {
        self.tables.get_mut(&table)
    }
}
