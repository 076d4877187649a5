//! Schema-time tablet map management.
//!
//! The allocator participates in DDL mutation assembly: creating a table in a
//! tablet-aware keyspace allocates a fresh tablet map for it, and dropping a
//! table (or a whole keyspace) removes the maps. The hooks append to a
//! caller-provided mutation list and are orthogonal to migration planning.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tablet_api::{HostId, TableId, TabletInfo, TabletMap, TabletReplica};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::balancer::PlanError;
use crate::load_sketch::LoadSketch;
use crate::topology::Topology;

/// Replication scheme of a keyspace. Only tablet-aware keyspaces get tablet
/// maps.
#[derive(Clone, Copy, Debug)]
pub enum ReplicationStrategy {
    Tablets {
        replication_factor: usize,
        initial_tablets: usize,
    },
    Vnodes,
}

impl ReplicationStrategy {
    pub fn uses_tablets(&self) -> bool {
        matches!(self, ReplicationStrategy::Tablets { .. })
    }
}

/// The slice of keyspace schema the allocator needs.
#[derive(Clone, Debug)]
pub struct KeyspaceDef {
    pub name: String,
    pub strategy: ReplicationStrategy,
    pub tables: Vec<TableId>,
}

/// A schema mutation produced by the allocator for the caller to commit.
#[derive(Clone, Debug)]
pub enum SchemaMutation {
    SetTabletMap { table: TableId, map: TabletMap },
    DropTabletMap { table: TableId },
}

#[derive(thiserror::Error, Debug)]
pub enum AllocationError {
    #[error("replication factor must be at least 1")]
    ZeroReplicationFactor,
    #[error("replication factor {rf} exceeds the {available} usable nodes")]
    NotEnoughNodes { rf: usize, available: usize },
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Issues schema-time tablet allocations and cleanup mutations over one
/// topology snapshot.
pub struct TabletAllocator {
    topology: Arc<Topology>,
}

impl TabletAllocator {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub async fn on_before_create_table(
        &self,
        keyspace: &KeyspaceDef,
        table: TableId,
        mutations: &mut Vec<SchemaMutation>,
        cancel: &CancellationToken,
    ) -> Result<(), AllocationError> {
        let ReplicationStrategy::Tablets {
            replication_factor,
            initial_tablets,
        } = keyspace.strategy
        else {
            return Ok(());
        };
        let map = self
            .allocate_tablets_for_new_table(replication_factor, initial_tablets, cancel)
            .await?;
        info!(
            "Allocated tablet map for table {table} in keyspace {}: {initial_tablets} tablets, rf={replication_factor}",
            keyspace.name
        );
        mutations.push(SchemaMutation::SetTabletMap { table, map });
        Ok(())
    }

    pub fn on_before_drop_table(
        &self,
        keyspace: &KeyspaceDef,
        table: TableId,
        mutations: &mut Vec<SchemaMutation>,
    ) {
        if keyspace.strategy.uses_tablets() {
            mutations.push(SchemaMutation::DropTabletMap { table });
        }
    }

    pub fn on_before_drop_keyspace(
        &self,
        keyspace: &KeyspaceDef,
        mutations: &mut Vec<SchemaMutation>,
    ) {
        if keyspace.strategy.uses_tablets() {
            for table in &keyspace.tables {
                mutations.push(SchemaMutation::DropTabletMap { table: *table });
            }
        }
    }

    /// Place `initial_tablets` tablets with `rf` replicas each. Replicas of a
    /// tablet go to distinct hosts, spread over racks round-robin (rotating
    /// the starting rack with the tablet index) and within a rack to the
    /// least-loaded host; shards come from the load sketch.
    async fn allocate_tablets_for_new_table(
        &self,
        rf: usize,
        initial_tablets: usize,
        cancel: &CancellationToken,
    ) -> Result<TabletMap, AllocationError> {
        if rf == 0 {
            return Err(AllocationError::ZeroReplicationFactor);
        }

        let mut racks: BTreeMap<String, Vec<HostId>> = BTreeMap::new();
        for dc in self.topology.datacenters() {
            self.topology.for_each_normal_node_in(dc, |node| {
                racks
                    .entry(node.rack().to_string())
                    .or_default()
                    .push(node.host());
            });
        }
        let available: usize = racks.values().map(|hosts| hosts.len()).sum();
        if available < rf {
            return Err(AllocationError::NotEnoughNodes { rf, available });
        }
        for hosts in racks.values_mut() {
            hosts.sort();
        }
        let rack_names: Vec<String> = racks.keys().cloned().collect();

        let mut sketch = LoadSketch::new();
        sketch.populate_all(&self.topology, cancel).await?;

        let mut tablets = Vec::with_capacity(initial_tablets);
        for tablet_idx in 0..initial_tablets {
            let mut used: HashSet<HostId> = HashSet::new();
            let mut replicas = Vec::with_capacity(rf);
            'placing: loop {
                let mut progressed = false;
                for i in 0..rack_names.len() {
                    let rack = &rack_names[(tablet_idx + i) % rack_names.len()];
                    let host = racks[rack]
                        .iter()
                        .copied()
                        .filter(|host| !used.contains(host))
                        .min_by_key(|host| (sketch.node_load(*host), *host));
                    if let Some(host) = host {
                        used.insert(host);
                        replicas.push(TabletReplica {
                            host,
                            shard: sketch.next_shard(host),
                        });
                        progressed = true;
                        if replicas.len() == rf {
                            break 'placing;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }
            debug_assert_eq!(replicas.len(), rf);
            tablets.push(TabletInfo::new(replicas));
        }
        Ok(TabletMap::new(tablets))
    }
}
