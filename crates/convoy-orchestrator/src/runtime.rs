use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::types::{FailOutcome, Task};
use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Executes tasks of one type.
///
/// The returned JSON value becomes the task's stored result. An error fails
/// the attempt; its message is recorded on the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> ConvoyResult<serde_json::Value>;
}

/// Handlers keyed by task type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        debug!(task_type = %task_type, "Registered task handler");
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a single poll cycle ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No pending task this agent can run.
    Idle,
    /// Another agent claimed the chosen task first.
    Contended { task_id: String },
    Completed { task_id: String },
    Failed { task_id: String, outcome: FailOutcome },
    /// The task was taken back (e.g. by the controller) before the report
    /// arrived, so the report was dropped.
    Rejected { task_id: String },
}

/// Worker loop for one agent: heartbeat, claim, execute, report.
pub struct AgentRuntime {
    agent_id: String,
    capabilities: BTreeSet<String>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    handlers: Arc<HandlerRegistry>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    task_timeout: Option<Duration>,
}

impl AgentRuntime {
    pub fn new(
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            registry,
            queue,
            handlers,
            poll_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(3),
            task_timeout: None,
        }
    }

    /// Sleep between polls when idle. Also the heartbeat period while a
    /// handler runs, unless set separately.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Fail an attempt whose handler runs longer than `timeout`.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Register this agent with its capabilities.
    pub async fn start(&self) -> ConvoyResult<()> {
        self.registry
            .register(&self.agent_id, self.capabilities.iter().cloned())
            .await?;
        info!(
            agent_id = %self.agent_id,
            handlers = ?self.handlers.task_types(),
            "Agent runtime started"
        );
        Ok(())
    }

    /// One heartbeat → claim → execute → report cycle.
    pub async fn run_once(&self) -> ConvoyResult<CycleOutcome> {
        self.registry.heartbeat(&self.agent_id).await;

        let Some(task_id) = self.queue.next_for(&self.agent_id).await? else {
            return Ok(CycleOutcome::Idle);
        };
        let task = match self.queue.assign(&task_id, &self.agent_id).await {
            Ok(task) => task,
            Err(e) if e.is_contention() || matches!(e, ConvoyError::TaskNotFound(_)) => {
                debug!(
                    agent_id = %self.agent_id,
                    task_id = %task_id,
                    error = %e,
                    "Lost claim race"
                );
                return Ok(CycleOutcome::Contended { task_id });
            }
            Err(e) => return Err(e),
        };

        info!(
            agent_id = %self.agent_id,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts + 1,
            "Executing task"
        );
        let report = match self.execute(&task).await {
            Ok(result) => self
                .queue
                .complete(&task.id, &self.agent_id, result)
                .await
                .map(|_| CycleOutcome::Completed {
                    task_id: task.id.clone(),
                }),
            Err(e) => {
                warn!(
                    agent_id = %self.agent_id,
                    task_id = %task.id,
                    error = %e,
                    "Task handler failed"
                );
                self.queue
                    .fail(&task.id, &self.agent_id, &e.to_string())
                    .await
                    .map(|outcome| CycleOutcome::Failed {
                        task_id: task.id.clone(),
                        outcome,
                    })
            }
        };

        match report {
            Err(ConvoyError::NotAssigned { .. }) => {
                warn!(
                    agent_id = %self.agent_id,
                    task_id = %task.id,
                    "Task was reassigned while running, report dropped"
                );
                Ok(CycleOutcome::Rejected { task_id: task.id })
            }
            other => other,
        }
    }

    /// Run the handler, heartbeating until it finishes.
    async fn execute(&self, task: &Task) -> ConvoyResult<serde_json::Value> {
        let handler = self.handlers.get(&task.task_type).ok_or_else(|| {
            ConvoyError::Handler(format!("No handler for task type '{}'", task.task_type))
        })?;

        let work = async {
            match self.task_timeout {
                Some(limit) => tokio::time::timeout(limit, handler.handle(task))
                    .await
                    .map_err(|_| {
                        ConvoyError::Handler(format!("Timed out after {}s", limit.as_secs_f64()))
                    })?,
                None => handler.handle(task).await,
            }
        };
        tokio::pin!(work);

        let period = self.heartbeat_interval.max(Duration::from_millis(10));
        let mut beat = tokio::time::interval(period);
        beat.tick().await;
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = beat.tick() => self.registry.heartbeat(&self.agent_id).await,
            }
        }
    }

    /// Poll until `shutdown` turns true, then deregister.
    ///
    /// Cycles that found work are followed immediately by the next one;
    /// idle cycles wait for the poll interval or a local submission.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ConvoyResult<()> {
        self.start().await?;
        let wake = self.queue.wake_handle();

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(CycleOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(agent_id = %self.agent_id, ?outcome, "Cycle finished");
                    false
                }
                Err(e) => {
                    error!(agent_id = %self.agent_id, error = %e, "Agent cycle failed");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.registry.deregister(&self.agent_id).await {
            warn!(agent_id = %self.agent_id, error = %e, "Deregistration on shutdown failed");
        }
        info!(agent_id = %self.agent_id, "Agent runtime stopped");
        Ok(())
    }
}
