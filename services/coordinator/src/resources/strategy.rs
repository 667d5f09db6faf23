//! Placement strategies.
//!
//! A strategy turns a requirement into a plan, a list of per-node
//! contributions, by reading the node table without mutating it. The
//! allocator commits the plan afterwards in the same critical section, so a
//! requirement the fleet cannot cover never touches any counter.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use orbit_id::NodeId;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::types::{NodeResources, ResourceKind, ResourceMap, TOLERANCE};
use super::AllocatorError;

/// Per-node contributions that together cover a requirement.
pub(crate) type Plan = Vec<(NodeId, ResourceMap)>;

/// How a requirement is spread over nodes.
///
/// A learned placement policy (Q-learning over a node/resource fitness
/// matrix) is planned as a further variant; it would plan through the same
/// read-only node view as the heuristics below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    /// Fill the proportionally least-loaded node that can take the whole
    /// remainder first; fall back to partial contributors.
    #[default]
    BinPacking,
    /// Split every kind across all nodes in proportion to their free capacity.
    Spread,
    /// Greedy fill in shuffled order. For load tests and fairness baselines.
    Random,
}

impl AllocationStrategy {
    pub const ALL: [AllocationStrategy; 3] = [
        AllocationStrategy::BinPacking,
        AllocationStrategy::Spread,
        AllocationStrategy::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BinPacking => "bin-packing",
            Self::Spread => "spread",
            Self::Random => "random",
        }
    }

    /// Compute a plan for `request` over the candidate `nodes`.
    ///
    /// On failure returns the part of the request no combination of nodes
    /// can cover.
    pub(crate) fn plan<'a>(
        &self,
        nodes: impl IntoIterator<Item = (&'a NodeId, &'a NodeResources)>,
        request: &ResourceMap,
    ) -> Result<Plan, ResourceMap> {
        let mut nodes: Vec<(&NodeId, &NodeResources)> = nodes.into_iter().collect();
        match self {
            Self::BinPacking => bin_packing(&nodes, request),
            Self::Spread => spread(&nodes, request),
            Self::Random => {
                nodes.shuffle(&mut rand::rng());
                greedy_fill(nodes, request)
            }
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStrategy {
    type Err = AllocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bin-packing" | "bin_packing" | "binpacking" => Ok(Self::BinPacking),
            "spread" => Ok(Self::Spread),
            "random" => Ok(Self::Random),
            _ => Err(AllocatorError::InvalidStrategy(s.to_string())),
        }
    }
}

/// Take as much of `remaining` as `node` can give. Satisfied kinds are
/// dropped from `remaining`.
fn contribute(node: &NodeResources, remaining: &mut ResourceMap) -> Option<ResourceMap> {
    let mut part = ResourceMap::new();
    for (kind, need) in remaining.iter_mut() {
        let take = need.min(node.free(*kind));
        if take > 0.0 {
            part.insert(*kind, take);
            *need -= take;
        }
    }
    remaining.retain(|_, need| *need > TOLERANCE);
    (!part.is_empty()).then_some(part)
}

fn greedy_fill<'a>(
    order: impl IntoIterator<Item = (&'a NodeId, &'a NodeResources)>,
    request: &ResourceMap,
) -> Result<Plan, ResourceMap> {
    let mut remaining = request.clone();
    let mut plan = Plan::new();

    for (node_id, node) in order {
        if remaining.is_empty() {
            break;
        }
        if let Some(part) = contribute(node, &mut remaining) {
            plan.push((node_id.clone(), part));
        }
    }

    if remaining.is_empty() {
        Ok(plan)
    } else {
        Err(remaining)
    }
}

/// Ranking key: nodes able to take the whole remainder first, then by score
/// (fitness or free ratio), then by node ID.
fn rank(
    a: (&NodeId, &NodeResources),
    b: (&NodeId, &NodeResources),
    remaining: &ResourceMap,
) -> Ordering {
    let key = |node: &NodeResources| {
        let fitness = node.fitness(remaining);
        if fitness >= 0.0 {
            (true, fitness)
        } else {
            (false, node.free_ratio(remaining))
        }
    };
    let (a_fits, a_score) = key(a.1);
    let (b_fits, b_score) = key(b.1);

    b_fits
        .cmp(&a_fits)
        .then_with(|| b_score.total_cmp(&a_score))
        .then_with(|| a.0.cmp(b.0))
}

fn bin_packing(
    nodes: &[(&NodeId, &NodeResources)],
    request: &ResourceMap,
) -> Result<Plan, ResourceMap> {
    let mut remaining = request.clone();
    let mut candidates = nodes.to_vec();
    let mut plan = Plan::new();

    // Scores depend on the remainder, so re-rank after every contribution.
    while !remaining.is_empty() {
        let Some(best) = candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| rank(**a, **b, &remaining))
            .map(|(index, _)| index)
        else {
            break;
        };

        let (node_id, node) = candidates.swap_remove(best);
        if let Some(part) = contribute(node, &mut remaining) {
            plan.push((node_id.clone(), part));
        }
    }

    if remaining.is_empty() {
        Ok(plan)
    } else {
        Err(remaining)
    }
}

fn spread<'a>(
    nodes: &[(&'a NodeId, &'a NodeResources)],
    request: &ResourceMap,
) -> Result<Plan, ResourceMap> {
    let mut shares: BTreeMap<&'a NodeId, ResourceMap> = BTreeMap::new();
    let mut shortfall = ResourceMap::new();

    for (&kind, &need) in request {
        let free: Vec<(&'a NodeId, f64)> = nodes
            .iter()
            .map(|(id, node)| (*id, node.free(kind)))
            .filter(|(_, free)| *free > 0.0)
            .collect();
        let available: f64 = free.iter().map(|(_, free)| free).sum();

        if available + TOLERANCE < need {
            shortfall.insert(kind, need - available);
            continue;
        }

        let mut placed = 0.0;
        for (node_id, node_free) in &free {
            let share = (need * node_free / available).min(*node_free);
            if share > 0.0 {
                add_share(&mut shares, node_id, kind, share);
                placed += share;
            }
        }

        // Rounding can leave a sliver unplaced; hand it to whoever has slack.
        let mut residue = need - placed;
        for (node_id, node_free) in &free {
            if residue <= 0.0 {
                break;
            }
            let planned = shares
                .get(node_id)
                .and_then(|part| part.get(&kind))
                .copied()
                .unwrap_or(0.0);
            let take = residue.min(node_free - planned);
            if take > 0.0 {
                add_share(&mut shares, node_id, kind, take);
                residue -= take;
            }
        }
    }

    if !shortfall.is_empty() {
        return Err(shortfall);
    }

    Ok(shares
        .into_iter()
        .map(|(node_id, part)| (node_id.clone(), part))
        .collect())
}

fn add_share<'a>(
    shares: &mut BTreeMap<&'a NodeId, ResourceMap>,
    node_id: &'a NodeId,
    kind: ResourceKind,
    amount: f64,
) {
    *shares
        .entry(node_id)
        .or_default()
        .entry(kind)
        .or_insert(0.0) += amount;
}
