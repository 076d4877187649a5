//! Planning core of the tablet load balancer.
//!
//! Given an immutable [`topology::Topology`] snapshot, [`balance_tablets`]
//! produces an incremental [`tablet_api::MigrationPlan`] that moves tablet
//! replicas toward an even per-shard distribution. The planner does not
//! execute migrations; the executor applies the plan and calls back in with a
//! fresh snapshot until the plan comes back empty.
//!
//! The schema-time surface (allocating and dropping tablet maps in response
//! to DDL) lives in [`allocator`] and is independent of the planning
//! algorithm.

pub mod allocator;
pub mod balancer;
pub mod load_sketch;
pub mod topology;

pub use balancer::{balance_tablets, LoadBalancer, PlanError};
