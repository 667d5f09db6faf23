//! Initial node inventory.
//!
//! A topology document lists every node with its scalar task capacity and
//! typed resource totals:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": "edge-1", "capacity": 8, "resources": { "cpu": 16, "memory": 64 } }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use orbit_id::NodeId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::resources::ResourceMap;

/// One node as described by a topology source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    /// Scalar task capacity.
    pub capacity: u64,
    /// Typed resource totals.
    #[serde(default)]
    pub resources: ResourceMap,
}

impl NodeSpec {
    pub fn new(id: NodeId, capacity: u64, resources: ResourceMap) -> Self {
        Self {
            id,
            capacity,
            resources,
        }
    }
}

/// Topology validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("duplicate node in topology: {0}")]
    DuplicateNode(NodeId),

    #[error("node {node_id} has an invalid {kind} total: {amount}")]
    InvalidTotal {
        node_id: NodeId,
        kind: String,
        amount: f64,
    },
}

/// Supplies the node inventory at startup.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn load(&self) -> Result<Vec<NodeSpec>>;
}

/// Fixed in-memory topology.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    nodes: Vec<NodeSpec>,
}

impl StaticTopology {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    async fn load(&self) -> Result<Vec<NodeSpec>> {
        validate(&self.nodes)?;
        Ok(self.nodes.clone())
    }
}

/// Topology read from a JSON file.
#[derive(Debug, Clone)]
pub struct FileTopology {
    path: PathBuf,
}

#[derive(Deserialize)]
struct TopologyDocument {
    nodes: Vec<NodeSpec>,
}

impl FileTopology {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TopologyProvider for FileTopology {
    async fn load(&self) -> Result<Vec<NodeSpec>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read topology {}", self.path.display()))?;

        let document: TopologyDocument = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse topology {}", self.path.display()))?;

        validate(&document.nodes)?;

        info!(
            path = %self.path.display(),
            node_count = document.nodes.len(),
            "Loaded topology file"
        );
        Ok(document.nodes)
    }
}

/// Reject duplicate IDs and totals that are negative or not finite.
pub fn validate(nodes: &[NodeSpec]) -> Result<(), TopologyError> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(&node.id) {
            return Err(TopologyError::DuplicateNode(node.id.clone()));
        }
        if let Some((kind, amount)) = node
            .resources
            .iter()
            .find(|(_, amount)| !amount.is_finite() || **amount < 0.0)
        {
            return Err(TopologyError::InvalidTotal {
                node_id: node.id.clone(),
                kind: kind.to_string(),
                amount: *amount,
            });
        }
    }
    Ok(())
}
