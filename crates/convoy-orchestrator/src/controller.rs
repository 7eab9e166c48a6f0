use crate::lock::{LockManager, CONTROLLER_LOCK};
use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::types::FailOutcome;
use convoy_core::{ControllerConfig, ConvoyError, ConvoyResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Failure reason recorded on tasks taken back from a silent agent.
pub const AGENT_TIMEOUT: &str = "agent_timeout";

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Another controller held the lock; nothing was done.
    pub skipped: bool,
    /// Agents newly marked inactive.
    pub stale_agents: Vec<String>,
    /// Tasks returned to pending.
    pub requeued: Vec<String>,
    /// Tasks that ran out of attempts.
    pub exhausted: Vec<String>,
    /// Archived tasks removed by cleanup.
    pub cleaned: usize,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether the pass changed anything.
    pub fn is_quiet(&self) -> bool {
        self.stale_agents.is_empty()
            && self.requeued.is_empty()
            && self.exhausted.is_empty()
            && self.cleaned == 0
    }
}

/// Periodic reconciliation: expires silent agents, takes their tasks back
/// and prunes the archive.
///
/// Several controllers may run against the same store; the `controller`
/// lock makes sure only one of them acts per tick.
pub struct Controller {
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    locks: Arc<LockManager>,
    config: ControllerConfig,
    last_cleanup: Mutex<Option<Instant>>,
}

impl Controller {
    pub fn new(
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        locks: Arc<LockManager>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            locks,
            config,
            last_cleanup: Mutex::new(None),
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Failures of individual steps are logged and do not abort the pass.
    /// Only a storage error while taking or releasing the controller lock is
    /// returned.
    pub async fn tick(&self) -> ConvoyResult<TickReport> {
        match self
            .locks
            .with_lock(CONTROLLER_LOCK, || async {
                Ok::<_, ConvoyError>(self.reconcile().await)
            })
            .await
        {
            Err(ConvoyError::LockTimeout(_)) => {
                debug!("Controller lock busy, skipping tick");
                Ok(TickReport::skipped())
            }
            other => other,
        }
    }

    async fn reconcile(&self) -> TickReport {
        let mut report = TickReport::default();

        match self
            .registry
            .expire_stale(self.config.heartbeat_timeout())
            .await
        {
            Ok(stale) => report.stale_agents = stale,
            Err(e) => error!(error = %e, "Controller: failed to expire stale agents"),
        }

        if let Err(e) = self.reclaim_orphans(&mut report).await {
            error!(error = %e, "Controller: failed to scan assigned tasks");
        }

        match self.cleanup_if_due().await {
            Ok(cleaned) => report.cleaned = cleaned,
            Err(e) => error!(error = %e, "Controller: archive cleanup failed"),
        }

        report
    }

    /// Fail every assigned task whose holder is inactive or gone.
    async fn reclaim_orphans(&self, report: &mut TickReport) -> ConvoyResult<()> {
        for task in self.queue.assigned().await? {
            let Some(holder) = task.assigned_agent.as_deref() else {
                continue;
            };
            let alive = match self.registry.get(holder).await {
                Ok(agent) => agent.is_some_and(|a| a.is_active()),
                Err(e) => {
                    warn!(agent_id = holder, error = %e, "Controller: cannot read agent");
                    continue;
                }
            };
            if alive {
                continue;
            }

            match self.queue.fail(&task.id, holder, AGENT_TIMEOUT).await {
                Ok(FailOutcome::Requeued { .. }) => report.requeued.push(task.id),
                Ok(FailOutcome::Exhausted { .. }) => report.exhausted.push(task.id),
                Err(e) if e.is_contention() => {
                    debug!(task_id = %task.id, error = %e, "Controller: task moved on, skipping");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Controller: failed to reclaim task");
                }
            }
        }
        Ok(())
    }

    async fn cleanup_if_due(&self) -> ConvoyResult<usize> {
        let mut last = self.last_cleanup.lock().await;
        if last.is_some_and(|at| at.elapsed() < self.config.cleanup_interval()) {
            return Ok(0);
        }
        let cleaned = self.queue.cleanup(self.config.retention()).await?;
        *last = Some(Instant::now());
        Ok(cleaned)
    }

    /// Tick every `interval` until `shutdown` turns true or its sender is
    /// dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval().max(Duration::from_millis(10));
        info!(
            interval_ms = interval.as_millis() as u64,
            heartbeat_timeout_secs = self.config.heartbeat_timeout_secs,
            "Controller started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(report) if !report.is_quiet() => info!(
                    stale_agents = report.stale_agents.len(),
                    requeued = report.requeued.len(),
                    exhausted = report.exhausted.len(),
                    cleaned = report.cleaned,
                    "Controller tick"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Controller tick failed"),
            }
        }
        info!("Controller stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
