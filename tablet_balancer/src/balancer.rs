//! Per-datacenter tablet migration planning.
//!
//! The planner equalizes the average per-shard tablet count across the nodes
//! of each datacenter. For every DC it picks the least-loaded node as the
//! migration target, then repeatedly takes a candidate tablet from the
//! most-loaded shard of the most-loaded node and moves it to the target's
//! least-loaded shard, until balance is reached or the plan holds one
//! migration per target shard. The produced plan is a small increment, not a
//! complete solution: the executor applies it and calls back in with a fresh
//! snapshot, and repeated rounds converge.
//!
//! Load is tracked at two levels. Node load (`tablet_count / shard_count`)
//! decides which nodes exchange tablets; per-shard load decides which shard
//! of the source gives one up. Balancing nodes first results in fewer
//! movements than balancing raw shards across the cluster.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

use anyhow::bail;
use itertools::Itertools;
use serde::Serialize;
use tablet_api::{GlobalTabletId, HostId, MigrationInfo, MigrationPlan, ShardId, TabletReplica};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::load_sketch::LoadSketch;
use crate::topology::Topology;

/// Scenarios in which a planning call cannot produce a plan.
#[derive(thiserror::Error, Debug)]
pub enum PlanError {
    #[error("Invalid topology: {0}")]
    InvalidTopology(Cow<'static, str>),
    #[error("Planning cancelled")]
    Cancelled,
}

/// How many tablets a scan visits between yields to the scheduler.
pub(crate) const SCAN_YIELD_INTERVAL: usize = 1024;

/// Yield to the scheduler every `interval` iterations, then bail out if the
/// planning call was cancelled. Cancellation is only observed here, so a
/// cancelled call never emits a partial plan.
pub(crate) async fn maybe_yield(
    iteration: usize,
    interval: usize,
    cancel: &CancellationToken,
) -> Result<(), PlanError> {
    if (iteration + 1) % interval == 0 {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(PlanError::Cancelled);
        }
    }
    Ok(())
}

/// Average per-shard load of a node, kept as an exact rational so that the
/// balance checks compare without rounding. `as_f64` exists for log output
/// only.
#[derive(Clone, Copy, Debug)]
struct AvgLoad {
    tablets: u64,
    shards: u64,
}

impl AvgLoad {
    const ZERO: AvgLoad = AvgLoad {
        tablets: 0,
        shards: 1,
    };

    fn new(tablets: u64, shards: u64) -> Self {
        debug_assert!(shards > 0);
        AvgLoad { tablets, shards }
    }

    fn as_f64(self) -> f64 {
        self.tablets as f64 / self.shards as f64
    }
}

impl PartialEq for AvgLoad {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AvgLoad {}

impl PartialOrd for AvgLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AvgLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.tablets as u128 * other.shards as u128)
            .cmp(&(other.tablets as u128 * self.shards as u128))
    }
}

/// Outer heap entry: most-loaded node first, ties to the lowest host id. The
/// load is a snapshot taken at push time; the planner re-reads live loads
/// after popping and re-pushes entries whenever a node's count changes.
#[derive(PartialEq, Eq)]
struct NodeByLoad {
    load: AvgLoad,
    host: HostId,
}

impl Ord for NodeByLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.load
            .cmp(&other.load)
            .then_with(|| other.host.cmp(&self.host))
    }
}

impl PartialOrd for NodeByLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Inner heap entry: most-loaded shard first, ties to the lowest shard id.
#[derive(PartialEq, Eq)]
struct ShardByLoad {
    tablet_count: u64,
    shard: ShardId,
}

impl Ord for ShardByLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tablet_count
            .cmp(&other.tablet_count)
            .then_with(|| other.shard.cmp(&self.shard))
    }
}

impl PartialOrd for ShardByLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default, Serialize)]
struct ShardLoad {
    tablet_count: u64,
    /// Tablets with a replica on this shard which may still be migrated away.
    candidates: BTreeSet<GlobalTabletId>,
}

#[derive(Serialize)]
struct NodeLoad {
    host: HostId,
    shard_count: u32,
    tablet_count: u64,
    /// Indexed by shard id.
    shards: Vec<ShardLoad>,
    #[serde(skip)]
    shards_by_load: BinaryHeap<ShardByLoad>,
}

impl NodeLoad {
    fn new(host: HostId, shard_count: u32) -> Self {
        let mut shards = Vec::new();
        shards.resize_with(shard_count as usize, ShardLoad::default);
        NodeLoad {
            host,
            shard_count,
            tablet_count: 0,
            shards,
            shards_by_load: BinaryHeap::new(),
        }
    }

    fn avg_load(&self) -> AvgLoad {
        self.avg_load_with(self.tablet_count)
    }

    /// The average load this node would have with `tablets` tablets.
    fn avg_load_with(&self, tablets: u64) -> AvgLoad {
        AvgLoad::new(tablets, self.shard_count as u64)
    }

    fn rebuild_shard_heap(&mut self) {
        self.shards_by_load = self
            .shards
            .iter()
            .enumerate()
            .filter(|(_, load)| load.tablet_count > 0)
            .map(|(shard, load)| ShardByLoad {
                tablet_count: load.tablet_count,
                shard: ShardId(shard as u32),
            })
            .collect();
    }

    /// Verify the internal statistics against each other. Logs details and
    /// returns an error on any mismatch.
    fn consistency_check(&self) -> anyhow::Result<()> {
        let shard_total: u64 = self.shards.iter().map(|s| s.tablet_count).sum();
        if shard_total != self.tablet_count {
            tracing::error!(
                "Node {} state: {}",
                self.host,
                serde_json::to_string(self)?
            );
            bail!(
                "node {}: tablet_count {} != shard total {}",
                self.host,
                self.tablet_count,
                shard_total
            );
        }

        let mut heap_shards: Vec<_> = self
            .shards_by_load
            .iter()
            .map(|e| (e.shard, e.tablet_count))
            .collect();
        heap_shards.sort();
        let expected: Vec<_> = self
            .shards
            .iter()
            .enumerate()
            .filter(|(_, load)| load.tablet_count > 0)
            .map(|(shard, load)| (ShardId(shard as u32), load.tablet_count))
            .collect();
        if heap_shards != expected {
            bail!("node {}: shard heap out of sync with shard loads", self.host);
        }

        for (shard, load) in self.shards.iter().enumerate() {
            if load.candidates.len() as u64 > load.tablet_count {
                bail!(
                    "node {}: shard {} has more candidates than tablets",
                    self.host,
                    shard
                );
            }
        }
        Ok(())
    }
}

/// Produces migration plans over one topology snapshot.
pub struct LoadBalancer {
    topology: Arc<Topology>,
    cancel: CancellationToken,
}

impl LoadBalancer {
    pub fn new(topology: Arc<Topology>, cancel: CancellationToken) -> Self {
        Self { topology, cancel }
    }

    /// Plan each datacenter separately and combine the results. The per-DC
    /// node sets are disjoint, so the sub-plans can execute in parallel.
    pub async fn make_plan(&self) -> Result<MigrationPlan, PlanError> {
        let mut plan = MigrationPlan::default();
        for dc in self.topology.datacenters() {
            let dc_plan = match self.make_plan_for_dc(dc).await {
                Ok(dc_plan) => dc_plan,
                Err(e @ PlanError::InvalidTopology(_)) => {
                    tracing::error!("Failed to plan DC {dc}: {e}");
                    return Err(e);
                }
                // Cancellation is silent: no partial plan, no noise.
                Err(e) => return Err(e),
            };
            info!("Prepared {} migrations in DC {dc}", dc_plan.len());
            plan.extend(dc_plan);
        }
        info!("Prepared {} migrations", plan.len());
        Ok(plan)
    }

    async fn make_plan_for_dc(&self, dc: &str) -> Result<MigrationPlan, PlanError> {
        info!("Examining DC {dc}");

        // Select the subset of nodes to balance.
        let mut nodes: HashMap<HostId, NodeLoad> = HashMap::new();
        self.topology.for_each_normal_node_in(dc, |node| {
            nodes.insert(node.host(), NodeLoad::new(node.host(), node.shard_count()));
        });
        for load in nodes.values() {
            if load.shard_count == 0 {
                return Err(PlanError::InvalidTopology(
                    format!("node {} has no shards in topology", load.host).into(),
                ));
            }
        }
        if nodes.is_empty() {
            debug!("No normal nodes in DC {dc}");
            return Ok(MigrationPlan::default());
        }

        // Compute tablet load on nodes.
        let mut scanned = 0;
        for (table, map) in self.topology.tables() {
            for (tablet, info) in map.tablets() {
                maybe_yield(scanned, SCAN_YIELD_INTERVAL, &self.cancel).await?;
                scanned += 1;
                for replica in info.replicas() {
                    let Some(load) = nodes.get_mut(&replica.host) else {
                        continue;
                    };
                    // The selection loop indexes shards by replica shard id.
                    if replica.shard.0 >= load.shard_count {
                        return Err(PlanError::InvalidTopology(
                            format!(
                                "tablet {}:{} replica {} targets non-existent shard",
                                table, tablet, replica
                            )
                            .into(),
                        ));
                    }
                    load.tablet_count += 1;
                }
            }
        }

        // Compute load imbalance.
        let target = nodes
            .values()
            .min_by_key(|load| (load.avg_load(), load.host))
            .map(|load| load.host)
            .unwrap();
        let min_load = nodes[&target].avg_load();
        let max_load = nodes.values().map(|load| load.avg_load()).max().unwrap();

        if min_load == max_load {
            debug!("DC {dc} is balanced");
            return Ok(MigrationPlan::default());
        }

        for load in nodes.values().sorted_by_key(|load| load.host) {
            info!(
                "Node {}: rack={} avg_load={:.3} tablets={} shards={}",
                load.host,
                self.topology.node(load.host).rack(),
                load.avg_load().as_f64(),
                load.tablet_count,
                load.shard_count
            );
        }
        info!(
            "Selected target node {target}: avg_load={:.3}, max avg_load={:.3}",
            min_load.as_f64(),
            max_load.as_f64()
        );

        // One migration per target shard saturates the target, assuming it is
        // internally balanced and migrations complete at a similar pace.
        let target_rack = self.topology.node(target).rack();
        let batch_size = self.topology.node(target).shard_count() as usize;

        // Compute per-shard load and candidate tablets.
        let mut scanned = 0;
        for (table, map) in self.topology.tables() {
            if map.has_pending_transitions() {
                // Balancing over in-flight transitions is not supported; they
                // must finish first.
                warn!("Table {table} has pending tablet transitions, not planning over DC {dc}");
                return Ok(MigrationPlan::default());
            }
            for (tablet, info) in map.tablets() {
                maybe_yield(scanned, SCAN_YIELD_INTERVAL, &self.cancel).await?;
                scanned += 1;
                for replica in info.replicas() {
                    let Some(load) = nodes.get_mut(&replica.host) else {
                        continue;
                    };
                    let shard = &mut load.shards[replica.shard.0 as usize];
                    shard.tablet_count += 1;
                    shard.candidates.insert(GlobalTabletId { table, tablet });
                }
            }
        }

        // Prepare candidate nodes and shards for heap-based balancing.
        let mut nodes_by_load: BinaryHeap<NodeByLoad> = BinaryHeap::with_capacity(nodes.len());
        for load in nodes.values_mut() {
            load.rebuild_shard_heap();
            nodes_by_load.push(NodeByLoad {
                load: load.avg_load(),
                host: load.host,
            });
        }
        if cfg!(debug_assertions) {
            for load in nodes.values() {
                if let Err(e) = load.consistency_check() {
                    return Err(PlanError::InvalidTopology(
                        format!("planner state inconsistent: {e}").into(),
                    ));
                }
            }
        }

        let mut target_sketch = LoadSketch::new();
        target_sketch
            .populate_node(&self.topology, target, &self.cancel)
            .await?;

        let mut plan = MigrationPlan::default();
        // Max load among nodes which ran out of candidates.
        let mut max_off_candidate_load = AvgLoad::ZERO;
        let mut iteration = 0;
        while plan.len() < batch_size && !nodes_by_load.is_empty() {
            maybe_yield(iteration, 1, &self.cancel).await?;
            iteration += 1;

            let src_host = nodes_by_load.pop().unwrap().host;
            let src_avg = nodes[&src_host].avg_load();
            let target_avg = nodes[&target].avg_load();

            // Nodes fall into three sets: the target, candidates (still in
            // the heap) and off-candidates (ran out of shards and were
            // dropped). The target's avg_load never exceeds any candidate's,
            // and any candidate's never exceeds any off-candidate's, because
            // candidates leave the heap in load order and load inversion
            // against the target is stopped below. So the candidates' max is
            // the current source and the off-candidates' max is tracked in
            // max_off_candidate_load; when the larger of the two equals the
            // target's load, every node is at the same average.
            if max_off_candidate_load.max(src_avg) == target_avg {
                debug!("Balance achieved in DC {dc}");
                break;
            }

            if src_avg <= target_avg {
                debug!(
                    "No more candidate nodes: next candidate is {src_host} with avg_load={:.3}, target avg_load={:.3}",
                    src_avg.as_f64(),
                    target_avg.as_f64()
                );
                break;
            }

            // Prevent load inversion, which can lead to oscillation between
            // rounds when tablet counts are close but shard counts differ.
            let src_load = &nodes[&src_host];
            let target_load = &nodes[&target];
            if src_load.avg_load_with(src_load.tablet_count - 1)
                < target_load.avg_load_with(target_load.tablet_count + 1)
            {
                debug!(
                    "Load would be inverted by moving a tablet from {src_host} (avg_load={:.3}) to {target} (avg_load={:.3})",
                    src_avg.as_f64(),
                    target_avg.as_f64()
                );
                break;
            }

            if nodes[&src_host].shards_by_load.is_empty() {
                debug!(
                    "Node {src_host} ran out of candidate shards with {} tablets remaining",
                    nodes[&src_host].tablet_count
                );
                max_off_candidate_load = max_off_candidate_load.max(src_avg);
                continue;
            }

            let (src_shard, shard_entry_count, tablet) = {
                let src_load = nodes.get_mut(&src_host).unwrap();
                let shard_entry = src_load.shards_by_load.pop().unwrap();
                let src_shard = shard_entry.shard;
                let shard_load = &mut src_load.shards[src_shard.0 as usize];
                if shard_load.candidates.is_empty() {
                    debug!(
                        "Shard {} ran out of candidates with {} tablets remaining",
                        TabletReplica {
                            host: src_host,
                            shard: src_shard
                        },
                        shard_load.tablet_count
                    );
                    // The shard is dropped for good; the node goes back for
                    // its other shards.
                    nodes_by_load.push(NodeByLoad {
                        load: src_avg,
                        host: src_host,
                    });
                    continue;
                }
                let tablet = shard_load.candidates.pop_first().unwrap();
                (src_shard, shard_entry.tablet_count, tablet)
            };

            // Check replication strategy constraints.
            let src = TabletReplica {
                host: src_host,
                shard: src_shard,
            };
            let info = self
                .topology
                .table(tablet.table)
                .get(tablet.tablet)
                .expect("Candidates reference existing tablets");
            let same_rack = target_rack == self.topology.node(src_host).rack();
            let mut has_replica_on_target = false;
            let mut rack_load: HashMap<&str, usize> = HashMap::new();
            for replica in info.replicas() {
                if replica.host == target {
                    has_replica_on_target = true;
                    break;
                }
                if !same_rack {
                    // Replica lists may name hosts from any DC, but a host
                    // missing from the snapshot altogether is corrupt input.
                    let Some(node) = self.topology.get_node(replica.host) else {
                        return Err(PlanError::InvalidTopology(
                            format!("tablet {} replica {} references unknown node", tablet, replica)
                                .into(),
                        ));
                    };
                    if node.dc() == dc {
                        *rack_load.entry(node.rack()).or_default() += 1;
                    }
                }
            }

            let rejected = if has_replica_on_target {
                debug!("Candidate tablet {tablet} skipped: it already has a replica on {target}");
                true
            } else if !same_rack {
                // Don't increase the level of rack duplication in the replica
                // list.
                let max_rack_load = rack_load.values().copied().max().unwrap_or(0);
                let new_rack_load = rack_load.get(target_rack).copied().unwrap_or(0) + 1;
                if new_rack_load > max_rack_load {
                    debug!(
                        "Candidate tablet {tablet} skipped: it would raise load on rack {target_rack} to {new_rack_load}, max={max_rack_load}"
                    );
                    true
                } else {
                    false
                }
            } else {
                false
            };

            if rejected {
                // The tablet stays out of the candidate pool: it cannot move
                // to this target this round. Shard and node go back on their
                // heaps for further candidates.
                let src_load = nodes.get_mut(&src_host).unwrap();
                src_load.shards_by_load.push(ShardByLoad {
                    tablet_count: shard_entry_count,
                    shard: src_shard,
                });
                nodes_by_load.push(NodeByLoad {
                    load: src_avg,
                    host: src_host,
                });
                continue;
            }

            let dst = TabletReplica {
                host: target,
                shard: target_sketch.next_shard(target),
            };
            debug!("Moving tablet {tablet} from {src} to {dst}");
            plan.push(MigrationInfo { tablet, src, dst });

            nodes.get_mut(&target).unwrap().tablet_count += 1;

            let src_load = nodes.get_mut(&src_host).unwrap();
            let shard_load = &mut src_load.shards[src_shard.0 as usize];
            shard_load.tablet_count -= 1;
            if shard_load.tablet_count > 0 {
                src_load.shards_by_load.push(ShardByLoad {
                    tablet_count: shard_load.tablet_count,
                    shard: src_shard,
                });
            }
            src_load.tablet_count -= 1;
            if src_load.tablet_count > 0 {
                nodes_by_load.push(NodeByLoad {
                    load: src_load.avg_load(),
                    host: src_host,
                });
            }
        }

        if plan.is_empty() {
            // Replica collocation can make even balance unreachable. With
            // nodes of disparate shard counts, the large node is a replica
            // for many tablets, which rules those tablets out as candidates
            // on the smaller, higher-load nodes.
            info!("Not possible to achieve balance in DC {dc}");
        }
        Ok(plan)
    }
}

/// Produce one incremental migration plan for the whole cluster. Invoke
/// repeatedly with fresh snapshots until the returned plan is empty.
pub async fn balance_tablets(
    topology: Arc<Topology>,
    cancel: &CancellationToken,
) -> Result<MigrationPlan, PlanError> {
    LoadBalancer::new(topology, cancel.clone()).make_plan().await
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::topology::{Node, NodeState};
    use tablet_api::{TableId, TabletInfo, TabletMap};

    /// Synthesize `n` normal nodes in one DC with host ids starting at
    /// `first_host`. Racks are assigned round-robin.
    pub(crate) fn make_test_nodes(
        first_host: u64,
        n: u64,
        dc: &str,
        racks: &[&str],
        shard_count: u32,
    ) -> Vec<Node> {
        let mut rack_iter = racks.iter().cycle();
        (first_host..first_host + n)
            .map(|host| {
                Node::new(
                    HostId(host),
                    dc.to_string(),
                    rack_iter.next().unwrap_or(&"rack-default").to_string(),
                    NodeState::Normal,
                    shard_count,
                )
            })
            .collect()
    }

    pub(crate) fn table_id(n: u8) -> TableId {
        TableId::from([n; 16])
    }

    pub(crate) fn tablet(replicas: &[(u64, u32)]) -> TabletInfo {
        TabletInfo::new(
            replicas
                .iter()
                .map(|&(host, shard)| TabletReplica {
                    host: HostId(host),
                    shard: ShardId(shard),
                })
                .collect(),
        )
    }

    pub(crate) fn make_topology(
        nodes: Vec<Node>,
        tables: Vec<(TableId, TabletMap)>,
    ) -> Arc<Topology> {
        let mut topology = Topology::new(1);
        for node in nodes {
            topology.node_upsert(node);
        }
        for (table, map) in tables {
            topology.table_upsert(table, map);
        }
        Arc::new(topology)
    }

    pub(crate) async fn plan_for(topology: &Arc<Topology>) -> MigrationPlan {
        balance_tablets(topology.clone(), &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Build the topology the executor would hand back after applying `plan`.
    pub(crate) fn apply_plan(topology: &Topology, plan: &MigrationPlan) -> Arc<Topology> {
        let mut next = topology.clone();
        for m in plan.iter() {
            let info = next
                .table_mut(m.tablet.table)
                .and_then(|map| map.get_mut(m.tablet.tablet))
                .unwrap();
            assert!(info.replace_replica(m.src, m.dst), "no replica at {}", m.src);
        }
        Arc::new(next)
    }

    /// Check the plan against the universal planner invariants: migrations
    /// stay inside one DC, no destination collides with an existing replica,
    /// no (tablet, source) pair repeats, per-DC plans are bounded by the
    /// target's shard count, every move keeps source load at or above target
    /// load, and cross-rack moves never worsen rack diversity.
    pub(crate) fn assert_plan_invariants(topology: &Topology, plan: &MigrationPlan) {
        use std::collections::{HashMap, HashSet};

        let mut counts: HashMap<HostId, u64> = HashMap::new();
        for (_, map) in topology.tables() {
            for (_, info) in map.tablets() {
                for replica in info.replicas() {
                    *counts.entry(replica.host).or_default() += 1;
                }
            }
        }

        let mut moved: HashSet<(GlobalTabletId, TabletReplica)> = HashSet::new();
        let mut per_dc: HashMap<&str, Vec<&MigrationInfo>> = HashMap::new();
        for m in plan.iter() {
            let info = topology.table(m.tablet.table).get(m.tablet.tablet).unwrap();
            let src_node = topology.node(m.src.host);
            let dst_node = topology.node(m.dst.host);

            assert!(
                info.replicas().contains(&m.src),
                "source replica does not exist: {m}"
            );
            assert!(
                !info.has_replica_on(m.dst.host),
                "destination collides with an existing replica: {m}"
            );
            assert!(moved.insert((m.tablet, m.src)), "tablet moved twice: {m}");
            assert_eq!(src_node.dc(), dst_node.dc(), "cross-DC migration: {m}");
            assert!(m.src.shard.0 < src_node.shard_count());
            assert!(m.dst.shard.0 < dst_node.shard_count());

            // No load inversion at the time of the move.
            let src_count = counts.get_mut(&m.src.host).unwrap();
            *src_count -= 1;
            let src_after = *src_count;
            let dst_after = {
                let dst_count = counts.entry(m.dst.host).or_default();
                *dst_count += 1;
                *dst_count
            };
            assert!(
                src_after as u128 * dst_node.shard_count() as u128
                    >= dst_after as u128 * src_node.shard_count() as u128,
                "load inverted by {m}"
            );

            // Cross-rack moves must not worsen rack diversity.
            if src_node.rack() != dst_node.rack() {
                let mut rack_load: HashMap<&str, usize> = HashMap::new();
                for replica in info.replicas() {
                    let node = topology.node(replica.host);
                    if node.dc() == dst_node.dc() {
                        *rack_load.entry(node.rack()).or_default() += 1;
                    }
                }
                let max_rack_load = rack_load.values().copied().max().unwrap_or(0);
                let dst_rack_load = rack_load.get(dst_node.rack()).copied().unwrap_or(0);
                assert!(
                    dst_rack_load + 1 <= max_rack_load,
                    "rack diversity worsened by {m}"
                );
            }

            per_dc.entry(dst_node.dc()).or_default().push(m);
        }

        for (dc, migrations) in per_dc {
            let target = migrations[0].dst.host;
            assert!(
                migrations.iter().all(|m| m.dst.host == target),
                "multiple targets in DC {dc}"
            );
            assert!(
                migrations.len() <= topology.node(target).shard_count() as usize,
                "plan for DC {dc} exceeds the target's shard count"
            );
        }
    }
}
