//! Typed resource allocation across the fleet.
//!
//! The allocator owns the node resource table:
//! - Nodes are registered with a fixed total per resource kind
//! - Allocations are planned by the active [`AllocationStrategy`] and
//!   committed all-or-nothing
//! - Releases decrement counters and never drive them below zero
//! - Cordoned nodes keep their counters but are left out of planning
//!
//! The whole table, including the active strategy, sits behind one
//! `RwLock`. Planning and commit run under a single write guard, so a
//! concurrent caller never observes a half-committed grant.

mod strategy;
mod types;

use std::collections::{BTreeMap, BTreeSet};

use orbit_id::{GrantId, NodeId};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

pub use strategy::AllocationStrategy;
pub use types::{
    format_resources, AllocationGrant, GrantPart, NodeResources, ResourceKind, ResourceMap,
    TOLERANCE,
};

/// Result type for allocator operations.
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Errors returned by the resource allocator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllocatorError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("insufficient resources: {} remaining", format_resources(.remaining))]
    InsufficientResources { remaining: ResourceMap },

    #[error("invalid allocation strategy: {0}")]
    InvalidStrategy(String),

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("invalid capacity for node {node_id}: {reason}")]
    InvalidCapacity { node_id: NodeId, reason: String },

    #[error("node {node_id} has {allocated} {kind} allocated, above the new total of {total}")]
    CapacityBelowAllocation {
        node_id: NodeId,
        kind: ResourceKind,
        allocated: f64,
        total: f64,
    },
}

#[derive(Debug, Default)]
struct AllocatorState {
    nodes: BTreeMap<NodeId, NodeResources>,
    cordoned: BTreeSet<NodeId>,
    strategy: AllocationStrategy,
}

/// Owner of the node resource table.
#[derive(Debug, Default)]
pub struct ResourceAllocator {
    state: RwLock<AllocatorState>,
}

impl ResourceAllocator {
    /// Create an empty allocator using `strategy`.
    pub fn new(strategy: AllocationStrategy) -> Self {
        Self {
            state: RwLock::new(AllocatorState {
                nodes: BTreeMap::new(),
                cordoned: BTreeSet::new(),
                strategy,
            }),
        }
    }

    /// Insert a node, or overwrite an existing one.
    ///
    /// Overwriting discards the node's allocation counters and cordon, so
    /// callers must not re-register a node that still holds grants.
    pub async fn register_node(&self, node_id: NodeId, total: ResourceMap) -> AllocatorResult<()> {
        validate_capacity(&node_id, &total)?;

        let mut state = self.state.write().await;
        if state.nodes.contains_key(&node_id) {
            warn!(node_id = %node_id, "Re-registering node, prior allocations are discarded");
        }
        info!(
            node_id = %node_id,
            resources = %format_resources(&total),
            "Registered node"
        );
        state.cordoned.remove(&node_id);
        state.nodes.insert(node_id, NodeResources::new(total));
        Ok(())
    }

    /// Remove a node from the table, returning its last known state.
    pub async fn deregister_node(&self, node_id: &NodeId) -> Option<NodeResources> {
        let mut state = self.state.write().await;
        state.cordoned.remove(node_id);
        let removed = state.nodes.remove(node_id);
        if removed.is_some() {
            info!(node_id = %node_id, "Deregistered node");
        }
        removed
    }

    /// Exclude a node from (`false`) or return it to (`true`) planning.
    /// Outstanding grants on the node are unaffected.
    pub async fn set_schedulable(&self, node_id: &NodeId, schedulable: bool) -> AllocatorResult<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(node_id) {
            return Err(AllocatorError::UnknownNode(node_id.clone()));
        }
        let changed = if schedulable {
            state.cordoned.remove(node_id)
        } else {
            state.cordoned.insert(node_id.clone())
        };
        if changed {
            info!(node_id = %node_id, schedulable, "Changed node schedulability");
        }
        Ok(())
    }

    /// Whether `node_id` is registered and not cordoned.
    pub async fn is_schedulable(&self, node_id: &NodeId) -> bool {
        let state = self.state.read().await;
        state.nodes.contains_key(node_id) && !state.cordoned.contains(node_id)
    }

    /// Replace the totals of the kinds named in `new_total`.
    ///
    /// Kinds absent from `new_total` keep their current total. Allocated
    /// counters are untouched, and the update is refused if any of them
    /// would exceed its new total.
    pub async fn update_node_resources(
        &self,
        node_id: &NodeId,
        new_total: ResourceMap,
    ) -> AllocatorResult<()> {
        validate_capacity(node_id, &new_total)?;

        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| AllocatorError::UnknownNode(node_id.clone()))?;

        let mut merged = node.total.clone();
        merged.extend(new_total);

        for (kind, total) in &merged {
            let allocated = node.allocated.get(kind).copied().unwrap_or(0.0);
            if allocated > *total {
                return Err(AllocatorError::CapacityBelowAllocation {
                    node_id: node_id.clone(),
                    kind: *kind,
                    allocated,
                    total: *total,
                });
            }
        }

        for kind in merged.keys() {
            node.allocated.entry(*kind).or_insert(0.0);
        }
        node.total = merged;
        node.last_updated = chrono::Utc::now();

        info!(
            node_id = %node_id,
            resources = %format_resources(&node.total),
            "Updated node resources"
        );
        Ok(())
    }

    /// Allocate `requirements` across the fleet with the active strategy.
    ///
    /// Either every part of the grant is committed, or nothing changes and
    /// `InsufficientResources` names what could not be covered.
    #[instrument(skip(self, requirements), fields(request = %format_resources(requirements)))]
    pub async fn allocate(&self, requirements: &ResourceMap) -> AllocatorResult<AllocationGrant> {
        validate_request(requirements)?;

        let mut state = self.state.write().await;
        let strategy = state.strategy;

        let candidates = state
            .nodes
            .iter()
            .filter(|(node_id, _)| !state.cordoned.contains(*node_id));
        let plan = strategy
            .plan(candidates, requirements)
            .map_err(|remaining| {
                warn!(
                    strategy = %strategy,
                    remaining = %format_resources(&remaining),
                    "Allocation denied"
                );
                AllocatorError::InsufficientResources { remaining }
            })?;

        let mut parts = Vec::with_capacity(plan.len());
        for (node_id, resources) in plan {
            if let Some(node) = state.nodes.get_mut(&node_id) {
                node.commit(&resources);
            }
            parts.push(GrantPart { node_id, resources });
        }

        let grant = AllocationGrant {
            id: GrantId::new(),
            strategy,
            parts,
        };
        debug!(
            grant_id = %grant.id,
            strategy = %strategy,
            node_count = grant.parts.len(),
            "Allocation committed"
        );
        Ok(grant)
    }

    /// Return `resources` to a node.
    ///
    /// Releasing against an unknown node is logged and ignored so retried
    /// releases stay harmless.
    pub async fn release(&self, node_id: &NodeId, resources: &ResourceMap) {
        let mut state = self.state.write().await;
        release_locked(&mut state, node_id, resources);
    }

    /// Release every part of a grant under one lock acquisition.
    pub async fn release_grant(&self, grant: &AllocationGrant) {
        let mut state = self.state.write().await;
        for part in &grant.parts {
            release_locked(&mut state, &part.node_id, &part.resources);
        }
        debug!(grant_id = %grant.id, "Released grant");
    }

    /// `allocated / total` per kind for one node.
    pub async fn utilization(&self, node_id: &NodeId) -> AllocatorResult<ResourceMap> {
        let state = self.state.read().await;
        state
            .nodes
            .get(node_id)
            .map(NodeResources::utilization)
            .ok_or_else(|| AllocatorError::UnknownNode(node_id.clone()))
    }

    /// Fleet-wide `sum(allocated) / sum(total)` per kind.
    pub async fn cluster_utilization(&self) -> ResourceMap {
        let state = self.state.read().await;
        let mut sums: BTreeMap<ResourceKind, (f64, f64)> = BTreeMap::new();
        for node in state.nodes.values() {
            for (kind, total) in &node.total {
                let entry = sums.entry(*kind).or_insert((0.0, 0.0));
                entry.0 += node.allocated.get(kind).copied().unwrap_or(0.0);
                entry.1 += total;
            }
        }
        sums.into_iter()
            .map(|(kind, (allocated, total))| {
                let ratio = if total > 0.0 { allocated / total } else { 0.0 };
                (kind, ratio)
            })
            .collect()
    }

    /// Copy of one node's counters.
    pub async fn node_snapshot(&self, node_id: &NodeId) -> Option<NodeResources> {
        self.state.read().await.nodes.get(node_id).cloned()
    }

    /// Registered node IDs in order.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.state.read().await.nodes.keys().cloned().collect()
    }

    /// Switch strategy by name.
    pub async fn set_strategy(&self, name: &str) -> AllocatorResult<()> {
        let strategy: AllocationStrategy = name.parse()?;
        self.use_strategy(strategy).await;
        Ok(())
    }

    /// Switch to `strategy`.
    pub async fn use_strategy(&self, strategy: AllocationStrategy) {
        self.state.write().await.strategy = strategy;
        info!(strategy = %strategy, "Changed allocation strategy");
    }

    /// The active strategy.
    pub async fn strategy(&self) -> AllocationStrategy {
        self.state.read().await.strategy
    }
}

fn release_locked(state: &mut AllocatorState, node_id: &NodeId, resources: &ResourceMap) {
    match state.nodes.get_mut(node_id) {
        Some(node) => {
            node.release(resources);
            debug!(
                node_id = %node_id,
                resources = %format_resources(resources),
                "Released resources"
            );
        }
        None => {
            warn!(node_id = %node_id, "Attempted to release resources from unknown node");
        }
    }
}

fn validate_request(requirements: &ResourceMap) -> AllocatorResult<()> {
    if requirements.is_empty() {
        return Err(AllocatorError::InvalidRequest(
            "requirement names no resources".to_string(),
        ));
    }
    if let Some((kind, amount)) = requirements
        .iter()
        .find(|(_, amount)| !amount.is_finite() || **amount <= 0.0)
    {
        return Err(AllocatorError::InvalidRequest(format!(
            "{kind} must be a positive amount, got {amount}"
        )));
    }
    Ok(())
}

fn validate_capacity(node_id: &NodeId, total: &ResourceMap) -> AllocatorResult<()> {
    if let Some((kind, amount)) = total
        .iter()
        .find(|(_, amount)| !amount.is_finite() || **amount < 0.0)
    {
        return Err(AllocatorError::InvalidCapacity {
            node_id: node_id.clone(),
            reason: format!("{kind} total must be a non-negative amount, got {amount}"),
        });
    }
    Ok(())
}
