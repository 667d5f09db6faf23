//! orbit fleet coordinator
//!
//! Tracks the worker nodes of a fleet, hands out their capacity, and reacts
//! when they stop reporting.
//!
//! ## Components
//!
//! - **Resource allocator** ([`resources`]): typed CPU/memory/GPU/storage
//!   accounting with pluggable, all-or-nothing placement strategies
//! - **Task orchestrator** ([`orchestrator`]): scalar task load per node and
//!   the task to node assignment table
//! - **Lifecycle manager** ([`lifecycle`]): heartbeats, failure detection,
//!   redistribution, recovery and eviction
//!
//! Each component owns its table behind its own lock. [`Coordinator`] wires
//! them together and keeps nodes with a failed agent out of placement;
//! [`MonitorWorker`] drives the lifecycle cycle in the background.

pub mod config;
pub mod coordinator;
pub mod hooks;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod resources;
pub mod topology;

pub use config::Config;
pub use coordinator::{
    AllocationDecision, AllocationStatus, Coordinator, CoordinatorError, PlacementGate,
};
pub use hooks::{
    AgentEvent, AgentObserver, AgentRestarter, MockRestarter, NoopObserver, RecordingObserver,
    RecordingRedistributor, TaskRedistributor,
};
pub use lifecycle::{
    AgentHealth, AgentLifecycleManager, AgentStatus, CycleReport, HeartbeatOutcome,
    LifecycleConfig, LifecycleError, MonitorError,
};
pub use monitor::{MonitorHandle, MonitorWorker};
pub use orchestrator::{
    NodeLoad, OrchestratorError, RedistributionReport, TaskOrchestrator, TaskPlacement,
};
pub use resources::{
    AllocationGrant, AllocationStrategy, AllocatorError, GrantPart, NodeResources,
    ResourceAllocator, ResourceKind, ResourceMap,
};
pub use topology::{FileTopology, NodeSpec, StaticTopology, TopologyError, TopologyProvider};
