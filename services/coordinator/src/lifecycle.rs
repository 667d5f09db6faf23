//! Agent liveness tracking and failure handling.
//!
//! Each agent moves through
//! `Active -> Degraded -> Failed -> Recovering -> Active | Removed`,
//! driven by heartbeats and by the monitor cycle in [`AgentLifecycleManager::tick`]:
//!
//! 1. Health check: agents silent for three check intervals gain a retry;
//!    crossing the failure threshold marks them inactive and triggers
//!    redistribution once.
//! 2. Recovery: inactive agents still inside the recovery window are
//!    restarted; a successful restart reactivates them.
//! 3. Cleanup: inactive agents past the recovery window, and abandoned
//!    agents, are removed.
//!
//! An [`AgentObserver`] hears about every failure, recovery and removal,
//! which lets placement stop using a node while its agent is down. The
//! agent table lock is never held across a hook or observer call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use orbit_id::NodeId;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::hooks::{AgentObserver, AgentRestarter, NoopObserver, TaskRedistributor};

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors returned to lifecycle callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown agent: {0}")]
    UnknownAgent(NodeId),
}

/// Errors raised inside a monitor cycle. Logged and collected, never
/// propagated out of the loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("failure window does not fit the clock range")]
    ClockOutOfRange,

    #[error("restart of agent {0} failed")]
    RestartFailure(NodeId),

    #[error("{hook} hook for agent {agent_id} timed out after {timeout:?}")]
    HookTimeout {
        hook: &'static str,
        agent_id: NodeId,
        timeout: Duration,
    },

    #[error("redistribution for agent {agent_id} failed: {reason}")]
    Redistribution { agent_id: NodeId, reason: String },
}

/// Lifecycle tuning knobs.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval between monitor cycles. An agent is stale after three.
    pub check_interval: Duration,

    /// Upper bound on a single restart or redistribution call.
    pub hook_timeout: Duration,

    /// An agent fails once its retry count exceeds this.
    pub failure_threshold: u32,

    /// Recovery is attempted while the retry count is at most this.
    pub recovery_limit: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            hook_timeout: Duration::from_secs(10),
            failure_threshold: 2,
            recovery_limit: 5,
        }
    }
}

/// Liveness record for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub last_heartbeat: DateTime<Utc>,
    /// Last reported metrics snapshot.
    pub resource_usage: BTreeMap<String, f64>,
    pub active: bool,
    /// Consecutive monitor cycles without a heartbeat.
    pub retry_count: u32,
    /// Explicitly given up on; removed at the next cleanup.
    pub abandoned: bool,
}

impl AgentStatus {
    fn new(resource_usage: BTreeMap<String, f64>, now: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat: now,
            resource_usage,
            active: true,
            retry_count: 0,
            abandoned: false,
        }
    }

    /// Where this agent sits in the lifecycle.
    pub fn health(&self, recovery_limit: u32) -> AgentHealth {
        match (self.active, self.retry_count) {
            (true, 0) => AgentHealth::Active,
            (true, _) => AgentHealth::Degraded,
            (false, retry) if retry <= recovery_limit && !self.abandoned => {
                AgentHealth::Recovering
            }
            (false, _) => AgentHealth::Failed,
        }
    }
}

/// Coarse lifecycle state derived from an [`AgentStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// Heartbeats arriving on time.
    Active,
    /// Missed at least one cycle, not yet failed.
    Degraded,
    /// Inactive and beyond recovery; awaiting removal.
    Failed,
    /// Inactive, restarts still being attempted.
    Recovering,
}

/// What a heartbeat did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// The agent was inactive and is active again.
    Reactivated,
    /// The agent is not registered; nothing changed.
    UnknownAgent,
}

/// Summary of one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Agents that missed this cycle's heartbeat window.
    pub missed: usize,
    /// Agents that transitioned to failed this cycle.
    pub failed: Vec<NodeId>,
    pub recovered: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub errors: Vec<MonitorError>,
}

/// Owner of the agent table.
pub struct AgentLifecycleManager {
    agents: RwLock<BTreeMap<NodeId, AgentStatus>>,
    redistributor: Arc<dyn TaskRedistributor>,
    restarter: Arc<dyn AgentRestarter>,
    observer: Arc<dyn AgentObserver>,
    config: LifecycleConfig,
}

impl AgentLifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        redistributor: Arc<dyn TaskRedistributor>,
        restarter: Arc<dyn AgentRestarter>,
    ) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            redistributor,
            restarter,
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    /// Report availability changes to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Start tracking an agent as active. Replaces any existing record.
    pub async fn register_agent(&self, agent_id: NodeId, initial_usage: BTreeMap<String, f64>) {
        let status = AgentStatus::new(initial_usage, Utc::now());
        self.agents.write().await.insert(agent_id.clone(), status);
        info!(agent_id = %agent_id, "Registered agent");
    }

    /// Record a heartbeat: refresh the timestamp, replace the metrics
    /// snapshot and clear the retry count.
    pub async fn update_heartbeat(
        &self,
        agent_id: &NodeId,
        metrics: BTreeMap<String, f64>,
    ) -> HeartbeatOutcome {
        let outcome = {
            let mut agents = self.agents.write().await;
            let Some(status) = agents.get_mut(agent_id) else {
                debug!(agent_id = %agent_id, "Heartbeat from unknown agent ignored");
                return HeartbeatOutcome::UnknownAgent;
            };

            status.last_heartbeat = Utc::now();
            status.resource_usage = metrics;
            status.retry_count = 0;

            if !status.active && !status.abandoned {
                status.active = true;
                HeartbeatOutcome::Reactivated
            } else {
                HeartbeatOutcome::Accepted
            }
        };

        if outcome == HeartbeatOutcome::Reactivated {
            info!(agent_id = %agent_id, "Agent reactivated by heartbeat");
            self.observer.agent_restored(agent_id).await;
        } else {
            debug!(agent_id = %agent_id, "Heartbeat updated");
        }
        outcome
    }

    /// Give up on an agent. It is marked inactive at once, its tasks are
    /// redistributed if it was still active, and cleanup removes it.
    pub async fn abandon_agent(&self, agent_id: &NodeId) -> LifecycleResult<()> {
        let was_active = {
            let mut agents = self.agents.write().await;
            let status = agents
                .get_mut(agent_id)
                .ok_or_else(|| LifecycleError::UnknownAgent(agent_id.clone()))?;
            let was_active = status.active;
            status.active = false;
            status.abandoned = true;
            was_active
        };

        info!(agent_id = %agent_id, "Agent abandoned");

        if was_active {
            self.observer.agent_failed(agent_id).await;
            if let Err(e) = self.redistribute(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Redistribution after abandonment failed");
            }
        }
        Ok(())
    }

    /// Copy of an agent's record.
    pub async fn agent_status(&self, agent_id: &NodeId) -> LifecycleResult<AgentStatus> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownAgent(agent_id.clone()))
    }

    /// Lifecycle state of one agent.
    pub async fn agent_health(&self, agent_id: &NodeId) -> LifecycleResult<AgentHealth> {
        let status = self.agent_status(agent_id).await?;
        Ok(status.health(self.config.recovery_limit))
    }

    /// Lifecycle state of every tracked agent.
    pub async fn health(&self) -> BTreeMap<NodeId, AgentHealth> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(id, status)| (id.clone(), status.health(self.config.recovery_limit)))
            .collect()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Run one monitor cycle against the wall clock.
    pub async fn tick(&self) -> CycleReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one monitor cycle as if the time were `now`.
    ///
    /// A failing phase is logged and the next phase still runs.
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        match self.check_health(now, &mut report).await {
            Ok(failed) => {
                for agent_id in &failed {
                    self.observer.agent_failed(agent_id).await;
                    if let Err(e) = self.redistribute(agent_id).await {
                        error!(agent_id = %agent_id, error = %e, "Task redistribution failed");
                        report.errors.push(e);
                    }
                }
                report.failed = failed;
            }
            Err(e) => {
                error!(error = %e, "Health check phase failed");
                report.errors.push(e);
            }
        }

        self.recover(now, &mut report).await;
        self.cleanup(&mut report).await;

        if !report.failed.is_empty() || !report.recovered.is_empty() || !report.removed.is_empty()
        {
            info!(
                missed = report.missed,
                failed = report.failed.len(),
                recovered = report.recovered.len(),
                removed = report.removed.len(),
                errors = report.errors.len(),
                "Monitor cycle complete"
            );
        }
        report
    }

    /// Count missed cycles and return agents that just failed.
    async fn check_health(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<Vec<NodeId>, MonitorError> {
        let window = self
            .config
            .check_interval
            .checked_mul(3)
            .and_then(|window| TimeDelta::from_std(window).ok())
            .ok_or(MonitorError::ClockOutOfRange)?;
        let threshold = now
            .checked_sub_signed(window)
            .ok_or(MonitorError::ClockOutOfRange)?;

        let mut failed = Vec::new();
        let mut agents = self.agents.write().await;
        for (agent_id, status) in agents.iter_mut() {
            if status.abandoned || status.last_heartbeat >= threshold {
                continue;
            }

            status.retry_count += 1;
            report.missed += 1;
            warn!(
                agent_id = %agent_id,
                retry_count = status.retry_count,
                "Agent missed heartbeat"
            );

            if status.active && status.retry_count > self.config.failure_threshold {
                status.active = false;
                error!(
                    agent_id = %agent_id,
                    retry_count = status.retry_count,
                    "Agent failed"
                );
                failed.push(agent_id.clone());
            }
        }
        Ok(failed)
    }

    /// Restart inactive agents still inside the recovery window.
    async fn recover(&self, now: DateTime<Utc>, report: &mut CycleReport) {
        let candidates: Vec<NodeId> = self
            .agents
            .read()
            .await
            .iter()
            .filter(|(_, status)| {
                !status.active
                    && !status.abandoned
                    && status.retry_count <= self.config.recovery_limit
            })
            .map(|(agent_id, _)| agent_id.clone())
            .collect();

        for agent_id in candidates {
            info!(agent_id = %agent_id, "Attempting agent recovery");

            match self.restart(&agent_id).await {
                Ok(()) => {
                    let restored = {
                        let mut agents = self.agents.write().await;
                        match agents.get_mut(&agent_id) {
                            Some(status) => {
                                status.active = true;
                                status.retry_count = 0;
                                status.last_heartbeat = now;
                                true
                            }
                            None => false,
                        }
                    };
                    if restored {
                        info!(agent_id = %agent_id, "Agent recovered");
                        self.observer.agent_restored(&agent_id).await;
                        report.recovered.push(agent_id);
                    }
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Agent recovery failed");
                    report.errors.push(e);
                }
            }
        }
    }

    /// Drop agents past recovery and agents that were abandoned.
    async fn cleanup(&self, report: &mut CycleReport) {
        let recovery_limit = self.config.recovery_limit;
        let mut removed = Vec::new();
        self.agents.write().await.retain(|agent_id, status| {
            let expired = status.abandoned
                || (!status.active && status.retry_count > recovery_limit);
            if expired {
                removed.push(agent_id.clone());
            }
            !expired
        });

        for agent_id in removed {
            info!(agent_id = %agent_id, "Removed inactive agent");
            self.observer.agent_removed(&agent_id).await;
            report.removed.push(agent_id);
        }
    }

    async fn redistribute(&self, agent_id: &NodeId) -> Result<(), MonitorError> {
        let timeout = self.config.hook_timeout;
        match tokio::time::timeout(timeout, self.redistributor.redistribute_tasks(agent_id)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MonitorError::Redistribution {
                agent_id: agent_id.clone(),
                reason: format!("{e:#}"),
            }),
            Err(_) => Err(MonitorError::HookTimeout {
                hook: "redistribution",
                agent_id: agent_id.clone(),
                timeout,
            }),
        }
    }

    async fn restart(&self, agent_id: &NodeId) -> Result<(), MonitorError> {
        let timeout = self.config.hook_timeout;
        match tokio::time::timeout(timeout, self.restarter.restart(agent_id)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(MonitorError::RestartFailure(agent_id.clone())),
            Err(_) => Err(MonitorError::HookTimeout {
                hook: "restart",
                agent_id: agent_id.clone(),
                timeout,
            }),
        }
    }
}
