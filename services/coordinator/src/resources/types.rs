//! Resource kinds, per-node resource accounting, and allocation grants.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use orbit_id::{GrantId, NodeId};
use serde::{Deserialize, Serialize};

use super::strategy::AllocationStrategy;

/// Amounts at or below this are treated as fully satisfied.
pub const TOLERANCE: f64 = 0.001;

/// A typed resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
    Storage,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Gpu,
        ResourceKind::Storage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Gpu => "gpu",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amounts keyed by resource kind. Ordered so output and planning are stable.
pub type ResourceMap = BTreeMap<ResourceKind, f64>;

/// Render a resource map as `cpu:10, memory:2.5`.
pub fn format_resources(resources: &ResourceMap) -> String {
    resources
        .iter()
        .map(|(kind, amount)| format!("{kind}:{amount}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Capacity and allocation counters for one node.
///
/// Invariant: `0 <= allocated[k] <= total[k]` for every kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResources {
    pub total: ResourceMap,
    pub allocated: ResourceMap,
    pub last_updated: DateTime<Utc>,
}

impl NodeResources {
    /// Fresh node with nothing allocated.
    pub fn new(total: ResourceMap) -> Self {
        let allocated = total.keys().map(|kind| (*kind, 0.0)).collect();
        Self {
            total,
            allocated,
            last_updated: Utc::now(),
        }
    }

    /// Unallocated capacity of `kind` (0 if the node lacks the kind).
    pub fn free(&self, kind: ResourceKind) -> f64 {
        let total = self.total.get(&kind).copied().unwrap_or(0.0);
        let allocated = self.allocated.get(&kind).copied().unwrap_or(0.0);
        (total - allocated).max(0.0)
    }

    /// `allocated / total` per kind; a zero total reports 0.0.
    pub fn utilization(&self) -> ResourceMap {
        self.total
            .iter()
            .map(|(kind, total)| {
                let allocated = self.allocated.get(kind).copied().unwrap_or(0.0);
                let ratio = if *total > 0.0 { allocated / total } else { 0.0 };
                (*kind, ratio)
            })
            .collect()
    }

    /// Bin-packing fitness against the outstanding requirement.
    ///
    /// Returns -1.0 unless the node can cover every outstanding kind from
    /// free capacity; otherwise the free/total ratio over the requested kinds.
    pub fn fitness(&self, remaining: &ResourceMap) -> f64 {
        if remaining
            .iter()
            .any(|(kind, need)| self.free(*kind) < *need)
        {
            return -1.0;
        }
        self.free_ratio(remaining)
    }

    /// Free over total capacity, summed across the kinds in `requested`.
    pub fn free_ratio(&self, requested: &ResourceMap) -> f64 {
        let (free, total) = requested.keys().fold((0.0, 0.0), |(free, total), kind| {
            (
                free + self.free(*kind),
                total + self.total.get(kind).copied().unwrap_or(0.0),
            )
        });
        if total > 0.0 {
            free / total
        } else {
            0.0
        }
    }

    /// Add `amounts` to the allocated counters, clamped to capacity.
    pub(crate) fn commit(&mut self, amounts: &ResourceMap) {
        for (kind, amount) in amounts {
            let total = self.total.get(kind).copied().unwrap_or(0.0);
            let allocated = self.allocated.entry(*kind).or_insert(0.0);
            *allocated = (*allocated + amount).min(total);
        }
        self.last_updated = Utc::now();
    }

    /// Subtract `amounts` from the allocated counters, floored at zero.
    /// Kinds the node does not track are ignored.
    pub(crate) fn release(&mut self, amounts: &ResourceMap) {
        for (kind, amount) in amounts {
            if let Some(allocated) = self.allocated.get_mut(kind) {
                *allocated = (*allocated - amount).max(0.0);
            }
        }
        self.last_updated = Utc::now();
    }
}

/// One node's contribution to a grant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantPart {
    pub node_id: NodeId,
    pub resources: ResourceMap,
}

/// A committed allocation, possibly spanning several nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationGrant {
    pub id: GrantId,
    pub strategy: AllocationStrategy,
    pub parts: Vec<GrantPart>,
}

impl AllocationGrant {
    /// Per-kind sum over all parts.
    pub fn total(&self) -> ResourceMap {
        let mut total = ResourceMap::new();
        for part in &self.parts {
            for (kind, amount) in &part.resources {
                *total.entry(*kind).or_insert(0.0) += amount;
            }
        }
        total
    }

    /// Nodes contributing to this grant, in grant order.
    pub fn node_ids(&self) -> Vec<&NodeId> {
        self.parts.iter().map(|part| &part.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(ResourceKind, f64)]) -> ResourceMap {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_new_node_starts_empty() {
        let node = NodeResources::new(map(&[(ResourceKind::Cpu, 8.0), (ResourceKind::Gpu, 2.0)]));
        assert_eq!(node.allocated.get(&ResourceKind::Cpu), Some(&0.0));
        assert_eq!(node.allocated.get(&ResourceKind::Gpu), Some(&0.0));
        assert_eq!(node.free(ResourceKind::Cpu), 8.0);
        assert_eq!(node.free(ResourceKind::Memory), 0.0);
    }

    #[test]
    fn test_fitness_excludes_nodes_that_cannot_cover() {
        let node = NodeResources::new(map(&[(ResourceKind::Cpu, 10.0), (ResourceKind::Memory, 20.0)]));
        let too_big = map(&[(ResourceKind::Cpu, 12.0), (ResourceKind::Memory, 18.0)]);
        assert_eq!(node.fitness(&too_big), -1.0);

        let fits = map(&[(ResourceKind::Cpu, 2.0)]);
        assert_eq!(node.fitness(&fits), 1.0);
    }

    #[test]
    fn test_fitness_prefers_least_loaded() {
        let mut busy = NodeResources::new(map(&[(ResourceKind::Cpu, 10.0)]));
        busy.commit(&map(&[(ResourceKind::Cpu, 6.0)]));
        let idle = NodeResources::new(map(&[(ResourceKind::Cpu, 10.0)]));
        let request = map(&[(ResourceKind::Cpu, 2.0)]);

        assert!((busy.fitness(&request) - 0.4).abs() < 1e-9);
        assert!(idle.fitness(&request) > busy.fitness(&request));
    }

    #[test]
    fn test_commit_and_release_stay_in_bounds() {
        let mut node = NodeResources::new(map(&[(ResourceKind::Cpu, 4.0)]));
        node.commit(&map(&[(ResourceKind::Cpu, 5.0)]));
        assert_eq!(node.allocated[&ResourceKind::Cpu], 4.0);

        node.release(&map(&[(ResourceKind::Cpu, 10.0), (ResourceKind::Gpu, 1.0)]));
        assert_eq!(node.allocated[&ResourceKind::Cpu], 0.0);
        assert!(!node.allocated.contains_key(&ResourceKind::Gpu));
    }

    #[test]
    fn test_utilization_with_zero_total() {
        let mut node = NodeResources::new(map(&[(ResourceKind::Cpu, 4.0), (ResourceKind::Gpu, 0.0)]));
        node.commit(&map(&[(ResourceKind::Cpu, 1.0)]));
        let util = node.utilization();
        assert_eq!(util[&ResourceKind::Cpu], 0.25);
        assert_eq!(util[&ResourceKind::Gpu], 0.0);
    }

    #[test]
    fn test_format_resources() {
        let resources = map(&[(ResourceKind::Memory, 2.5), (ResourceKind::Cpu, 10.0)]);
        assert_eq!(format_resources(&resources), "cpu:10, memory:2.5");
    }

    #[test]
    fn test_resource_kind_serde() {
        let json = serde_json::to_string(&map(&[(ResourceKind::Gpu, 1.0)])).unwrap();
        assert_eq!(json, r#"{"gpu":1.0}"#);
        let parsed: ResourceMap = serde_json::from_str(r#"{"cpu": 4, "storage": 100}"#).unwrap();
        assert_eq!(parsed[&ResourceKind::Cpu], 4.0);
        assert_eq!(parsed[&ResourceKind::Storage], 100.0);
    }
}
