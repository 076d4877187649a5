use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{HostId, ShardId, TableId, TabletId};

/// A placement of one tablet replica at a specific (node, shard).
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TabletReplica {
    pub host: HostId,
    pub shard: ShardId,
}

impl fmt::Display for TabletReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.shard)
    }
}

/// Tablet identity across the cluster.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct GlobalTabletId {
    pub table: TableId,
    pub tablet: TabletId,
}

impl fmt::Display for GlobalTabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.tablet)
    }
}

/// Replica list of a single tablet. The length is the table's replication
/// factor; no two replicas share a host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletInfo {
    replicas: Vec<TabletReplica>,
}

impl TabletInfo {
    pub fn new(replicas: Vec<TabletReplica>) -> Self {
        debug_assert!(
            {
                let mut hosts: Vec<_> = replicas.iter().map(|r| r.host).collect();
                hosts.sort();
                hosts.windows(2).all(|w| w[0] != w[1])
            },
            "duplicate replica host in tablet info"
        );
        Self { replicas }
    }

    pub fn replicas(&self) -> &[TabletReplica] {
        &self.replicas
    }

    pub fn has_replica_on(&self, host: HostId) -> bool {
        self.replicas.iter().any(|r| r.host == host)
    }

    /// Replace the replica at `src` with `dst`. Returns false if no replica
    /// matches `src`.
    pub fn replace_replica(&mut self, src: TabletReplica, dst: TabletReplica) -> bool {
        match self.replicas.iter_mut().find(|r| **r == src) {
            Some(r) => {
                *r = dst;
                true
            }
            None => false,
        }
    }
}

/// An in-flight tablet move recorded in the tablet map. Its presence inhibits
/// planning over the owning table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletTransition {
    pub next: Vec<TabletReplica>,
}

/// Per-table mapping from tablet to replica list, plus the set of pending
/// transitions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TabletMap {
    tablets: Vec<TabletInfo>,
    transitions: BTreeMap<TabletId, TabletTransition>,
}

impl TabletMap {
    pub fn new(tablets: Vec<TabletInfo>) -> Self {
        Self {
            tablets,
            transitions: BTreeMap::new(),
        }
    }

    pub fn tablet_count(&self) -> usize {
        self.tablets.len()
    }

    pub fn get(&self, tablet: TabletId) -> Option<&TabletInfo> {
        self.tablets.get(tablet.0 as usize)
    }

    pub fn get_mut(&mut self, tablet: TabletId) -> Option<&mut TabletInfo> {
        self.tablets.get_mut(tablet.0 as usize)
    }

    /// Iterate tablets in tablet-id order.
    pub fn tablets(&self) -> impl Iterator<Item = (TabletId, &TabletInfo)> {
        self.tablets
            .iter()
            .enumerate()
            .map(|(i, info)| (TabletId(i as u64), info))
    }

    pub fn has_pending_transitions(&self) -> bool {
        !self.transitions.is_empty()
    }

    pub fn set_transition(&mut self, tablet: TabletId, transition: TabletTransition) {
        self.transitions.insert(tablet, transition);
    }

    pub fn clear_transition(&mut self, tablet: TabletId) {
        self.transitions.remove(&tablet);
    }
}
