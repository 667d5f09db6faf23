//! The coordinator context.
//!
//! Built once at startup and passed by reference. It owns the three
//! components and is the only place they are wired together:
//! - The task orchestrator doubles as the lifecycle manager's
//!   redistribution hook
//! - A [`PlacementGate`] observes the lifecycle manager and cordons a node
//!   in both placement tables while its agent is down, then deregisters it
//!   once the agent is evicted

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use orbit_id::{NodeId, TaskId};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::hooks::{AgentObserver, AgentRestarter};
use crate::lifecycle::{
    AgentLifecycleManager, HeartbeatOutcome, LifecycleConfig, LifecycleResult,
};
use crate::monitor::{MonitorHandle, MonitorWorker};
use crate::orchestrator::{OrchestratorError, OrchestratorResult, TaskOrchestrator, TaskPlacement};
use crate::resources::{
    AllocationGrant, AllocationStrategy, AllocatorError, AllocatorResult, ResourceAllocator,
    ResourceMap,
};
use crate::topology::{self, NodeSpec, TopologyError, TopologyProvider};

/// Errors spanning more than one component.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Whether an allocation went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AllocationStatus {
    Approved,
    Denied,
}

/// Answer to an allocation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationDecision {
    pub status: AllocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<AllocationGrant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AllocationDecision {
    pub fn is_approved(&self) -> bool {
        self.status == AllocationStatus::Approved
    }
}

impl From<AllocatorResult<AllocationGrant>> for AllocationDecision {
    fn from(result: AllocatorResult<AllocationGrant>) -> Self {
        match result {
            Ok(grant) => Self {
                status: AllocationStatus::Approved,
                grant: Some(grant),
                reason: None,
            },
            Err(e) => Self {
                status: AllocationStatus::Denied,
                grant: None,
                reason: Some(e.to_string()),
            },
        }
    }
}

/// Keeps the allocator and orchestrator in step with agent availability.
pub struct PlacementGate {
    allocator: Arc<ResourceAllocator>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl PlacementGate {
    pub fn new(allocator: Arc<ResourceAllocator>, orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self {
            allocator,
            orchestrator,
        }
    }

    async fn set_schedulable(&self, node_id: &NodeId, schedulable: bool) {
        // Agents may be tracked without a node in one of the tables.
        if let Err(e) = self.allocator.set_schedulable(node_id, schedulable).await {
            debug!(node_id = %node_id, error = %e, "Allocator has no such node");
        }
        if let Err(e) = self.orchestrator.set_schedulable(node_id, schedulable).await {
            debug!(node_id = %node_id, error = %e, "Orchestrator has no such node");
        }
    }
}

#[async_trait]
impl AgentObserver for PlacementGate {
    async fn agent_failed(&self, agent_id: &NodeId) {
        self.set_schedulable(agent_id, false).await;
    }

    async fn agent_restored(&self, agent_id: &NodeId) {
        self.set_schedulable(agent_id, true).await;
    }

    async fn agent_removed(&self, agent_id: &NodeId) {
        self.allocator.deregister_node(agent_id).await;
        if let Err(e) = self.orchestrator.deregister_node(agent_id).await {
            debug!(node_id = %agent_id, error = %e, "Orchestrator has no such node");
        }
    }
}

/// Fleet coordinator.
pub struct Coordinator {
    allocator: Arc<ResourceAllocator>,
    orchestrator: Arc<TaskOrchestrator>,
    lifecycle: Arc<AgentLifecycleManager>,
}

impl Coordinator {
    /// Empty fleet.
    pub fn new(
        strategy: AllocationStrategy,
        lifecycle_config: LifecycleConfig,
        restarter: Arc<dyn AgentRestarter>,
    ) -> Self {
        let allocator = Arc::new(ResourceAllocator::new(strategy));
        let orchestrator = Arc::new(TaskOrchestrator::new());
        let gate = PlacementGate::new(allocator.clone(), orchestrator.clone());
        let lifecycle = Arc::new(
            AgentLifecycleManager::new(lifecycle_config, orchestrator.clone(), restarter)
                .with_observer(Arc::new(gate)),
        );
        Self {
            allocator,
            orchestrator,
            lifecycle,
        }
    }

    /// Build from configuration and register every node `topology` supplies.
    pub async fn bootstrap(
        config: &Config,
        topology: &dyn TopologyProvider,
        restarter: Arc<dyn AgentRestarter>,
    ) -> Result<Self> {
        let coordinator = Self::new(config.strategy, config.lifecycle(), restarter);

        let nodes = topology.load().await?;
        coordinator
            .orchestrator
            .load_topology(nodes.iter().map(|node| (node.id.clone(), node.capacity)))
            .await;
        for node in nodes {
            coordinator
                .allocator
                .register_node(node.id.clone(), node.resources)
                .await?;
            coordinator
                .lifecycle
                .register_agent(node.id, BTreeMap::new())
                .await;
        }

        info!(
            node_count = coordinator.allocator.node_ids().await.len(),
            strategy = %config.strategy,
            "Coordinator bootstrapped"
        );
        Ok(coordinator)
    }

    /// Register a node with the allocator, the orchestrator and the
    /// lifecycle manager. The node is schedulable afterwards.
    #[instrument(skip(self, spec), fields(node_id = %spec.id))]
    pub async fn register_node(&self, spec: NodeSpec) -> Result<(), CoordinatorError> {
        topology::validate(std::slice::from_ref(&spec))?;

        self.orchestrator
            .register_node(spec.id.clone(), spec.capacity)
            .await?;
        self.allocator
            .register_node(spec.id.clone(), spec.resources)
            .await?;
        self.lifecycle.register_agent(spec.id, BTreeMap::new()).await;
        Ok(())
    }

    /// Allocate typed resources. Failures come back as a denial.
    pub async fn allocate(&self, requirements: &ResourceMap) -> AllocationDecision {
        self.allocator.allocate(requirements).await.into()
    }

    pub async fn release(&self, node_id: &NodeId, resources: &ResourceMap) {
        self.allocator.release(node_id, resources).await;
    }

    pub async fn release_grant(&self, grant: &AllocationGrant) {
        self.allocator.release_grant(grant).await;
    }

    /// Place a scalar task requirement.
    pub async fn allocate_task(&self, requirement: u64) -> OrchestratorResult<TaskPlacement> {
        self.orchestrator.allocate_task(requirement).await
    }

    pub async fn release_task(&self, task_id: &TaskId) -> u64 {
        self.orchestrator.release_task(task_id).await
    }

    pub async fn update_heartbeat(
        &self,
        agent_id: &NodeId,
        metrics: BTreeMap<String, f64>,
    ) -> HeartbeatOutcome {
        self.lifecycle.update_heartbeat(agent_id, metrics).await
    }

    /// Give up on an agent; see [`AgentLifecycleManager::abandon_agent`].
    pub async fn abandon_agent(&self, agent_id: &NodeId) -> LifecycleResult<()> {
        self.lifecycle.abandon_agent(agent_id).await
    }

    pub async fn utilization(&self, node_id: &NodeId) -> AllocatorResult<ResourceMap> {
        self.allocator.utilization(node_id).await
    }

    pub async fn set_strategy(&self, name: &str) -> AllocatorResult<()> {
        self.allocator.set_strategy(name).await
    }

    /// Spawn the monitor loop.
    pub fn start_monitoring(&self) -> MonitorHandle {
        MonitorWorker::new(self.lifecycle.clone()).spawn()
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::MockRestarter;
    use crate::resources::ResourceKind;
    use crate::topology::StaticTopology;

    fn spec(name: &str, capacity: u64, cpu: f64) -> NodeSpec {
        NodeSpec::new(
            NodeId::parse(name).unwrap(),
            capacity,
            ResourceMap::from([(ResourceKind::Cpu, cpu)]),
        )
    }

    async fn coordinator(nodes: Vec<NodeSpec>) -> Coordinator {
        Coordinator::bootstrap(
            &Config::default(),
            &StaticTopology::new(nodes),
            Arc::new(MockRestarter::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_registers_everywhere() {
        let coordinator = coordinator(vec![spec("a", 4, 8.0), spec("b", 2, 4.0)]).await;

        assert_eq!(coordinator.allocator().node_ids().await.len(), 2);
        assert_eq!(coordinator.lifecycle().agent_count().await, 2);
        let load = coordinator
            .orchestrator()
            .node_load(&NodeId::parse("a").unwrap())
            .await
            .unwrap();
        assert_eq!(load.capacity, 4);
    }

    #[tokio::test]
    async fn test_allocate_decision() {
        let coordinator = coordinator(vec![spec("a", 4, 8.0)]).await;

        let approved = coordinator
            .allocate(&ResourceMap::from([(ResourceKind::Cpu, 4.0)]))
            .await;
        assert!(approved.is_approved());
        assert!(approved.reason.is_none());

        let denied = coordinator
            .allocate(&ResourceMap::from([(ResourceKind::Cpu, 10.0)]))
            .await;
        assert_eq!(denied.status, AllocationStatus::Denied);
        assert!(denied.grant.is_none());
        assert_eq!(
            denied.reason.as_deref(),
            Some("insufficient resources: cpu:6 remaining")
        );

        let json = serde_json::to_value(&denied).unwrap();
        assert_eq!(json["status"], "DENIED");
    }

    #[tokio::test]
    async fn test_register_node_rejects_invalid_totals() {
        let coordinator = coordinator(Vec::new()).await;
        let err = coordinator
            .register_node(spec("a", 4, -1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Topology(_)));
        assert_eq!(coordinator.lifecycle().agent_count().await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_node_leaves_placement_tables() {
        let coordinator = coordinator(vec![spec("a", 4, 8.0), spec("b", 4, 8.0)]).await;
        let a = NodeId::parse("a").unwrap();
        let task = coordinator.allocate_task(3).await.unwrap();
        assert_eq!(task.node_ids(), vec![a.clone()]);

        coordinator.abandon_agent(&a).await.unwrap();
        assert!(!coordinator.allocator().is_schedulable(&a).await);
        assert!(!coordinator.orchestrator().node_load(&a).await.unwrap().schedulable);
        let grant = coordinator
            .allocate(&ResourceMap::from([(ResourceKind::Cpu, 2.0)]))
            .await
            .grant
            .unwrap();
        assert!(grant.node_ids().iter().all(|node_id| **node_id != a));

        let report = coordinator.lifecycle().tick().await;
        assert_eq!(report.removed, vec![a.clone()]);
        assert!(coordinator.allocator().node_snapshot(&a).await.is_none());
        assert!(coordinator.orchestrator().node_load(&a).await.is_err());
        assert!(!coordinator
            .orchestrator()
            .placement(&task.task_id)
            .await
            .unwrap()
            .node_ids()
            .contains(&a));
    }

    #[tokio::test]
    async fn test_heartbeat_and_strategy_passthrough() {
        let coordinator = coordinator(vec![spec("a", 4, 8.0)]).await;
        let a = NodeId::parse("a").unwrap();

        assert_eq!(
            coordinator.update_heartbeat(&a, BTreeMap::new()).await,
            HeartbeatOutcome::Accepted
        );
        coordinator.set_strategy("random").await.unwrap();
        assert_eq!(
            coordinator.allocator().strategy().await,
            AllocationStrategy::Random
        );
    }
}
