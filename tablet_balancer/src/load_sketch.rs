use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tablet_api::{HostId, ShardId};
use tokio_util::sync::CancellationToken;

use crate::balancer::{maybe_yield, PlanError, SCAN_YIELD_INTERVAL};
use crate::topology::Topology;

/// Heap slot ordering: fewest tablets first, ties broken by lowest shard id.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
struct ShardSlot {
    tablet_count: u64,
    shard: ShardId,
}

struct NodeSketch {
    shards_by_load: BinaryHeap<Reverse<ShardSlot>>,
    tablet_count: u64,
}

/// Tracks per-shard live tablet counts for a set of nodes and hands out
/// destination shards for new replicas.
///
/// Seeded from the same topology snapshot the planner uses; every
/// [`LoadSketch::next_shard`] call returns the least-loaded shard of the node
/// and counts the assignment, so successive calls round-robin over the
/// least-loaded shards. Pending migrations from other rounds are not
/// speculated on.
pub struct LoadSketch {
    nodes: HashMap<HostId, NodeSketch>,
}

impl LoadSketch {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Track a single node, seeding shard counts from its current replicas.
    pub async fn populate_node(
        &mut self,
        topology: &Topology,
        host: HostId,
        cancel: &CancellationToken,
    ) -> Result<(), PlanError> {
        self.populate(topology, Some(host), cancel).await
    }

    /// Track every normal node in the snapshot.
    pub async fn populate_all(
        &mut self,
        topology: &Topology,
        cancel: &CancellationToken,
    ) -> Result<(), PlanError> {
        self.populate(topology, None, cancel).await
    }

    async fn populate(
        &mut self,
        topology: &Topology,
        only: Option<HostId>,
        cancel: &CancellationToken,
    ) -> Result<(), PlanError> {
        let mut counts: HashMap<HostId, Vec<u64>> = HashMap::new();
        match only {
            Some(host) => {
                let node = topology.node(host);
                counts.insert(host, vec![0; node.shard_count() as usize]);
            }
            None => {
                for dc in topology.datacenters() {
                    topology.for_each_normal_node_in(dc, |node| {
                        counts.insert(node.host(), vec![0; node.shard_count() as usize]);
                    });
                }
            }
        }

        let mut scanned = 0;
        for (table, map) in topology.tables() {
            for (tablet, info) in map.tablets() {
                maybe_yield(scanned, SCAN_YIELD_INTERVAL, cancel).await?;
                scanned += 1;
                for replica in info.replicas() {
                    let Some(shards) = counts.get_mut(&replica.host) else {
                        continue;
                    };
                    let Some(count) = shards.get_mut(replica.shard.0 as usize) else {
                        return Err(PlanError::InvalidTopology(
                            format!(
                                "tablet {}:{} replica {} targets non-existent shard",
                                table, tablet, replica
                            )
                            .into(),
                        ));
                    };
                    *count += 1;
                }
            }
        }

        for (host, shards) in counts {
            let tablet_count = shards.iter().sum();
            let shards_by_load = shards
                .into_iter()
                .enumerate()
                .map(|(shard, tablet_count)| {
                    Reverse(ShardSlot {
                        tablet_count,
                        shard: ShardId(shard as u32),
                    })
                })
                .collect();
            self.nodes.insert(
                host,
                NodeSketch {
                    shards_by_load,
                    tablet_count,
                },
            );
        }
        Ok(())
    }

    /// The least-loaded shard of `host`, with ties going to the lowest shard
    /// id. The returned shard's count is incremented so that repeated calls
    /// spread assignments.
    pub fn next_shard(&mut self, host: HostId) -> ShardId {
        let node = self
            .nodes
            .get_mut(&host)
            .expect("next_shard on a node the sketch was not populated with");
        let Reverse(mut slot) = node
            .shards_by_load
            .pop()
            .expect("populated nodes have at least one shard");
        slot.tablet_count += 1;
        node.tablet_count += 1;
        let shard = slot.shard;
        node.shards_by_load.push(Reverse(slot));
        shard
    }

    /// Total tablets currently tracked for `host`, including assignments made
    /// through [`LoadSketch::next_shard`].
    pub fn node_load(&self, host: HostId) -> u64 {
        self.nodes.get(&host).map(|n| n.tablet_count).unwrap_or(0)
    }
}

impl Default for LoadSketch {
    fn default() -> Self {
        Self::new()
    }
}
