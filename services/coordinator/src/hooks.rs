//! Hooks the lifecycle manager calls on collaborators.
//!
//! - [`TaskRedistributor`]: moves a failed agent's tasks elsewhere
//! - [`AgentRestarter`]: tries to bring a failed agent back online
//! - [`AgentObserver`]: follows agents failing, coming back and leaving
//!
//! Mock implementations are provided for tests and local runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use orbit_id::NodeId;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Re-homes the outstanding work of a failed agent.
///
/// Must be idempotent and accept agents it has never heard of.
#[async_trait]
pub trait TaskRedistributor: Send + Sync {
    async fn redistribute_tasks(&self, agent_id: &NodeId) -> Result<()>;
}

/// Restarts an external agent process.
///
/// Returns `false` on failure; implementations must not panic.
#[async_trait]
pub trait AgentRestarter: Send + Sync {
    async fn restart(&self, agent_id: &NodeId) -> bool;
}

/// Told when an agent's availability changes. Called outside the agent
/// table lock; every method defaults to a no-op.
#[async_trait]
pub trait AgentObserver: Send + Sync {
    /// The agent failed or was abandoned. Runs before its tasks are
    /// redistributed.
    async fn agent_failed(&self, _agent_id: &NodeId) {}

    /// The agent is active again, after a restart or a heartbeat.
    async fn agent_restored(&self, _agent_id: &NodeId) {}

    /// The agent was dropped from the agent table.
    async fn agent_removed(&self, _agent_id: &NodeId) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}

/// Mock restarter with scripted outcomes.
pub struct MockRestarter {
    /// Outcomes consumed one per attempt, before falling back to `default_outcome`.
    script: Mutex<VecDeque<bool>>,

    default_outcome: bool,

    /// Simulated restart latency.
    delay: Duration,

    attempts: AtomicU64,
    history: Mutex<Vec<NodeId>>,
}

impl MockRestarter {
    /// A restarter whose restarts always succeed.
    pub fn new() -> Self {
        Self::with_script(Vec::new(), true)
    }

    /// A restarter whose restarts always fail.
    pub fn failing() -> Self {
        Self::with_script(Vec::new(), false)
    }

    /// Play back `outcomes` in order, then keep returning `then`.
    pub fn with_script(outcomes: Vec<bool>, then: bool) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            default_outcome: then,
            delay: Duration::ZERO,
            attempts: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Sleep for `delay` before answering each restart.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of restart attempts so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Agents restarted so far, in call order.
    pub async fn history(&self) -> Vec<NodeId> {
        self.history.lock().await.clone()
    }
}

impl Default for MockRestarter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRestarter for MockRestarter {
    async fn restart(&self, agent_id: &NodeId) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.history.lock().await.push(agent_id.clone());

        info!(agent_id = %agent_id, "[MOCK] Restarting agent");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(self.default_outcome);

        debug!(agent_id = %agent_id, outcome, "[MOCK] Restart finished");
        outcome
    }
}

/// Redistributor that only records which agents it was asked about.
#[derive(Default)]
pub struct RecordingRedistributor {
    calls: Mutex<Vec<NodeId>>,
}

impl RecordingRedistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agents passed to `redistribute_tasks`, in call order.
    pub async fn calls(&self) -> Vec<NodeId> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl TaskRedistributor for RecordingRedistributor {
    async fn redistribute_tasks(&self, agent_id: &NodeId) -> Result<()> {
        self.calls.lock().await.push(agent_id.clone());
        Ok(())
    }
}

/// An availability change seen by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Failed(NodeId),
    Restored(NodeId),
    Removed(NodeId),
}

/// Observer that keeps every event it receives.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<AgentEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AgentObserver for RecordingObserver {
    async fn agent_failed(&self, agent_id: &NodeId) {
        self.events.lock().await.push(AgentEvent::Failed(agent_id.clone()));
    }

    async fn agent_restored(&self, agent_id: &NodeId) {
        self.events.lock().await.push(AgentEvent::Restored(agent_id.clone()));
    }

    async fn agent_removed(&self, agent_id: &NodeId) {
        self.events.lock().await.push(AgentEvent::Removed(agent_id.clone()));
    }
}
