//! Task placement over scalar node capacity.
//!
//! The orchestrator:
//! - Tracks a `capacity`/`load` pair per node, independent of the typed
//!   resource table kept by the allocator
//! - Splits a task's requirement over the nodes with the most free capacity
//! - Remembers each task's per-node share so releases subtract exactly that
//!   share and leave other tasks on the same node untouched
//! - Re-places a failed node's shares on the remaining nodes
//!
//! A cordoned node keeps its load but is never chosen for new shares.
//! Redistribution cordons the node it empties.

use std::collections::BTreeMap;

use async_trait::async_trait;
use orbit_id::{NodeId, TaskId};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::hooks::TaskRedistributor;

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors returned by the task orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("node {node_id} carries load {load}, above the new capacity of {capacity}")]
    CapacityBelowLoad {
        node_id: NodeId,
        capacity: u64,
        load: u64,
    },

    #[error("invalid task requirement: {0}")]
    InvalidRequest(String),
}

/// Scalar capacity view of a node. Invariant: `load <= capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeLoad {
    pub capacity: u64,
    pub load: u64,
    /// Cleared while the node's agent is down.
    pub schedulable: bool,
}

impl NodeLoad {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            load: 0,
            schedulable: true,
        }
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.load)
    }
}

/// Where a task's requirement landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskPlacement {
    pub task_id: TaskId,
    pub requirement: u64,
    /// Units held per node, most-free node first at allocation time.
    pub shares: Vec<(NodeId, u64)>,
    /// Units that lost their node and could not be re-placed.
    pub stranded: u64,
}

impl TaskPlacement {
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.shares.iter().map(|(node_id, _)| node_id.clone()).collect()
    }
}

/// Outcome of re-homing one node's tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedistributionReport {
    /// Tasks whose share on the failed node found a new home.
    pub moved: Vec<TaskId>,
    /// Tasks whose share could not be re-placed.
    pub stranded: Vec<TaskId>,
}

impl RedistributionReport {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.stranded.is_empty()
    }
}

#[derive(Debug, Clone)]
struct TaskRecord {
    requirement: u64,
    shares: Vec<(NodeId, u64)>,
    stranded: u64,
}

impl TaskRecord {
    fn share_on(&self, node_id: &NodeId) -> Option<u64> {
        self.shares
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, units)| *units)
    }

    fn take_share(&mut self, node_id: &NodeId) -> Option<u64> {
        let index = self.shares.iter().position(|(id, _)| id == node_id)?;
        Some(self.shares.remove(index).1)
    }

    fn add_share(&mut self, node_id: NodeId, units: u64) {
        match self.shares.iter_mut().find(|(id, _)| *id == node_id) {
            Some((_, held)) => *held = held.saturating_add(units),
            None => self.shares.push((node_id, units)),
        }
    }

    fn placement(&self, task_id: TaskId) -> TaskPlacement {
        TaskPlacement {
            task_id,
            requirement: self.requirement,
            shares: self.shares.clone(),
            stranded: self.stranded,
        }
    }
}

#[derive(Debug, Default)]
struct OrchestratorState {
    nodes: BTreeMap<NodeId, NodeLoad>,
    tasks: BTreeMap<TaskId, TaskRecord>,
}

impl OrchestratorState {
    /// Greedy plan over schedulable nodes sorted by free capacity
    /// (descending, then by ID). Returns the free total, capped at
    /// `u64::MAX`, when it cannot cover `units`.
    fn plan(&self, units: u64) -> Result<Vec<(NodeId, u64)>, u64> {
        let mut candidates: Vec<(&NodeId, u64)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.schedulable)
            .map(|(id, node)| (id, node.free()))
            .filter(|(_, free)| *free > 0)
            .collect();

        let available = candidates
            .iter()
            .fold(0u64, |acc, (_, free)| acc.saturating_add(*free));
        if available < units {
            return Err(available);
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut remaining = units;
        let mut shares = Vec::new();
        for (node_id, free) in candidates {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(free);
            shares.push((node_id.clone(), take));
            remaining -= take;
        }
        Ok(shares)
    }

    fn commit(&mut self, shares: &[(NodeId, u64)]) {
        for (node_id, units) in shares {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.load = node.load.saturating_add(*units).min(node.capacity);
            }
        }
    }

    fn unload(&mut self, node_id: &NodeId, units: u64) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.load = node.load.saturating_sub(units);
        }
    }

    /// Cordon `node_id` and move every share it holds onto other nodes.
    fn evacuate(&mut self, node_id: &NodeId) -> RedistributionReport {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.schedulable = false;
        }

        let mut report = RedistributionReport::default();
        let affected: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, record)| record.share_on(node_id).is_some())
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in affected {
            let Some(units) = self
                .tasks
                .get_mut(&task_id)
                .and_then(|record| record.take_share(node_id))
            else {
                continue;
            };
            self.unload(node_id, units);

            match self.plan(units) {
                Ok(shares) => {
                    self.commit(&shares);
                    if let Some(record) = self.tasks.get_mut(&task_id) {
                        for (target, moved) in shares {
                            record.add_share(target, moved);
                        }
                    }
                    report.moved.push(task_id);
                }
                Err(available) => {
                    error!(
                        task_id = %task_id,
                        units,
                        available,
                        "No capacity left to re-place task share"
                    );
                    if let Some(record) = self.tasks.get_mut(&task_id) {
                        record.stranded = record.stranded.saturating_add(units);
                    }
                    report.stranded.push(task_id);
                }
            }
        }
        report
    }
}

/// Owner of node load and task assignments.
#[derive(Debug, Default)]
pub struct TaskOrchestrator {
    state: RwLock<OrchestratorState>,
}

impl TaskOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node table with `nodes`, all unloaded, and forget every task.
    pub async fn load_topology(&self, nodes: impl IntoIterator<Item = (NodeId, u64)>) {
        let mut state = self.state.write().await;
        state.nodes = nodes
            .into_iter()
            .map(|(node_id, capacity)| (node_id, NodeLoad::new(capacity)))
            .collect();
        state.tasks.clear();
        info!(node_count = state.nodes.len(), "Loaded task topology");
    }

    /// Add a node, or change the capacity of an existing one.
    ///
    /// A registered node is schedulable, even if it was cordoned before.
    pub async fn register_node(&self, node_id: NodeId, capacity: u64) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        match state.nodes.get_mut(&node_id) {
            Some(node) if capacity < node.load => Err(OrchestratorError::CapacityBelowLoad {
                node_id,
                capacity,
                load: node.load,
            }),
            Some(node) => {
                node.capacity = capacity;
                node.schedulable = true;
                debug!(node_id = %node_id, capacity, "Updated node capacity");
                Ok(())
            }
            None => {
                debug!(node_id = %node_id, capacity, "Registered node capacity");
                state.nodes.insert(node_id, NodeLoad::new(capacity));
                Ok(())
            }
        }
    }

    /// Cordon (`false`) or uncordon (`true`) a node. Existing shares stay put.
    pub async fn set_schedulable(
        &self,
        node_id: &NodeId,
        schedulable: bool,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::UnknownNode(node_id.clone()))?;
        if node.schedulable != schedulable {
            node.schedulable = schedulable;
            info!(node_id = %node_id, schedulable, "Changed node schedulability");
        }
        Ok(())
    }

    /// Move a node's shares elsewhere and drop it from the table.
    #[instrument(skip(self, node_id), fields(node_id = %node_id))]
    pub async fn deregister_node(
        &self,
        node_id: &NodeId,
    ) -> OrchestratorResult<RedistributionReport> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(node_id) {
            return Err(OrchestratorError::UnknownNode(node_id.clone()));
        }
        let report = state.evacuate(node_id);
        state.nodes.remove(node_id);
        info!(
            moved = report.moved.len(),
            stranded = report.stranded.len(),
            "Deregistered node"
        );
        Ok(report)
    }

    /// Place `requirement` units across the nodes with the most free capacity.
    ///
    /// Nothing is committed unless the whole requirement fits.
    #[instrument(skip(self))]
    pub async fn allocate_task(&self, requirement: u64) -> OrchestratorResult<TaskPlacement> {
        if requirement == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "requirement must be at least 1".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        let shares = state.plan(requirement).map_err(|available| {
            warn!(requirement, available, "Task allocation denied");
            OrchestratorError::InsufficientCapacity {
                requested: requirement,
                available,
            }
        })?;

        state.commit(&shares);

        let task_id = TaskId::new();
        let record = TaskRecord {
            requirement,
            shares,
            stranded: 0,
        };
        let placement = record.placement(task_id);
        state.tasks.insert(task_id, record);

        debug!(
            task_id = %task_id,
            node_count = placement.shares.len(),
            "Task allocated"
        );
        Ok(placement)
    }

    /// Release `task_id`'s share on each of `node_ids`.
    ///
    /// Only the task's own units are subtracted. Releasing the last share
    /// forgets the task. Unknown tasks and nodes the task does not occupy
    /// are ignored; returns the units released.
    pub async fn release_resources(&self, task_id: &TaskId, node_ids: &[NodeId]) -> u64 {
        let mut state = self.state.write().await;

        let Some(mut record) = state.tasks.remove(task_id) else {
            warn!(task_id = %task_id, "Attempted to release unknown task");
            return 0;
        };

        let mut released = 0u64;
        for node_id in node_ids {
            if let Some(units) = record.take_share(node_id) {
                state.unload(node_id, units);
                released = released.saturating_add(units);
            }
        }

        if record.shares.is_empty() {
            debug!(task_id = %task_id, released, "Task released");
        } else {
            state.tasks.insert(*task_id, record);
        }
        released
    }

    /// Release every share `task_id` holds.
    pub async fn release_task(&self, task_id: &TaskId) -> u64 {
        let node_ids = match self.placement(task_id).await {
            Ok(placement) => placement.node_ids(),
            Err(_) => Vec::new(),
        };
        self.release_resources(task_id, &node_ids).await
    }

    /// Cordon `node_id` and move every task share it holds onto the other
    /// schedulable nodes.
    ///
    /// Safe to call repeatedly: a node with no shares, or one never
    /// registered, yields an empty report.
    #[instrument(skip(self, node_id), fields(node_id = %node_id))]
    pub async fn redistribute(&self, node_id: &NodeId) -> RedistributionReport {
        let report = self.state.write().await.evacuate(node_id);
        if !report.is_empty() {
            info!(
                moved = report.moved.len(),
                stranded = report.stranded.len(),
                "Redistributed tasks"
            );
        }
        report
    }

    /// Current placement of a task.
    pub async fn placement(&self, task_id: &TaskId) -> OrchestratorResult<TaskPlacement> {
        self.state
            .read()
            .await
            .tasks
            .get(task_id)
            .map(|record| record.placement(*task_id))
            .ok_or(OrchestratorError::UnknownTask(*task_id))
    }

    /// Load view of one node.
    pub async fn node_load(&self, node_id: &NodeId) -> OrchestratorResult<NodeLoad> {
        self.state
            .read()
            .await
            .nodes
            .get(node_id)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownNode(node_id.clone()))
    }

    /// Tasks holding a share on `node_id`.
    pub async fn tasks_on(&self, node_id: &NodeId) -> Vec<TaskId> {
        self.state
            .read()
            .await
            .tasks
            .iter()
            .filter(|(_, record)| record.share_on(node_id).is_some())
            .map(|(task_id, _)| *task_id)
            .collect()
    }
}

#[async_trait]
impl TaskRedistributor for TaskOrchestrator {
    async fn redistribute_tasks(&self, agent_id: &NodeId) -> anyhow::Result<()> {
        self.redistribute(agent_id).await;
        Ok(())
    }
}
