use crate::controller::Controller;
use crate::lock::LockManager;
use crate::registry::AgentRegistry;
use crate::results::ResultStore;
use crate::runtime::{AgentRuntime, HandlerRegistry};
use crate::task_queue::TaskQueue;
use crate::types::{
    Agent, Aggregate, NewTask, RegistryStatus, SystemStats, Task, TaskResult, TaskStatus,
    TaskSummary, Workflow, WorkflowSummary,
};
use crate::workflow::WorkflowCoordinator;
use convoy_core::{ConvoyConfig, ConvoyResult};
use convoy_store::{MemoryStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// One handle on the whole engine.
///
/// All components share one [`Store`] and one [`LockManager`], so every
/// `Orchestrator` (and every process) pointed at the same store sees and
/// coordinates on the same state.
pub struct Orchestrator {
    config: ConvoyConfig,
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    results: ResultStore,
    workflows: WorkflowCoordinator,
}

impl Orchestrator {
    /// Wire every component on top of `store`.
    pub fn new(store: Arc<dyn Store>, config: ConvoyConfig) -> Self {
        let locks = Arc::new(LockManager::from_config(store.clone(), &config.locks));
        let registry = Arc::new(AgentRegistry::new(store.clone(), locks.clone()));
        let results = ResultStore::new(store.clone());
        let queue = Arc::new(
            TaskQueue::new(store.clone(), locks.clone(), registry.clone(), results.clone())
                .with_default_max_attempts(config.agent.default_max_attempts),
        );
        let workflows = WorkflowCoordinator::new(store.clone(), locks.clone(), queue.clone());

        Self {
            config,
            store,
            locks,
            registry,
            queue,
            results,
            workflows,
        }
    }

    /// Open the configured store and wire the engine on it.
    pub async fn open(config: ConvoyConfig) -> ConvoyResult<Self> {
        let store = convoy_store::open(&config.storage).await?;
        info!(
            backend = ?config.storage.backend,
            data_dir = %config.storage.data_dir.display(),
            "Store opened"
        );
        Ok(Self::new(store, config))
    }

    /// Process-local engine with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), ConvoyConfig::default())
    }

    pub fn config(&self) -> &ConvoyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn workflows(&self) -> &WorkflowCoordinator {
        &self.workflows
    }

    /// A controller using the `[controller]` configuration.
    pub fn controller(&self) -> Controller {
        Controller::new(
            self.registry.clone(),
            self.queue.clone(),
            self.locks.clone(),
            self.config.controller.clone(),
        )
    }

    /// An agent runtime using the `[agent]` configuration.
    pub fn runtime(
        &self,
        agent_id: &str,
        capabilities: &[String],
        handlers: Arc<HandlerRegistry>,
    ) -> AgentRuntime {
        AgentRuntime::new(
            agent_id,
            capabilities.iter().cloned(),
            self.registry.clone(),
            self.queue.clone(),
            handlers,
        )
        .with_poll_interval(self.config.agent.poll_interval())
        .with_task_timeout(self.config.agent.task_timeout())
    }

    // --- agents ---

    pub async fn register_agent(
        &self,
        agent_id: &str,
        capabilities: &[String],
    ) -> ConvoyResult<Agent> {
        self.registry
            .register(agent_id, capabilities.iter().cloned())
            .await
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> ConvoyResult<()> {
        self.registry.deregister(agent_id).await
    }

    /// Active agents, optionally only those with `capability`.
    pub async fn list_agents(&self, capability: Option<&str>) -> ConvoyResult<Vec<Agent>> {
        Ok(self
            .registry
            .agents()
            .await?
            .into_iter()
            .filter(|a| a.is_active() && capability.map_or(true, |c| a.has_capability(c)))
            .collect())
    }

    pub async fn agent_status(&self) -> ConvoyResult<RegistryStatus> {
        self.registry.status().await
    }

    // --- tasks ---

    pub async fn submit_task(&self, task: NewTask) -> ConvoyResult<String> {
        self.queue.submit(task).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> ConvoyResult<Vec<TaskSummary>> {
        Ok(self
            .queue
            .list(status)
            .await?
            .iter()
            .map(Task::summary)
            .collect())
    }

    pub async fn task_status(&self, task_id: &str) -> ConvoyResult<Task> {
        self.queue.get(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> ConvoyResult<()> {
        self.queue.cancel(task_id).await
    }

    /// Requeue failed tasks that finished within the last `max_age_hours`.
    pub async fn retry_failed(&self, max_age_hours: u64) -> ConvoyResult<usize> {
        self.queue
            .retry_failed(Duration::from_secs(max_age_hours.saturating_mul(HOUR)))
            .await
    }

    // --- workflows ---

    pub async fn submit_workflow(&self, name: &str, tasks: Vec<NewTask>) -> ConvoyResult<String> {
        self.workflows.submit_workflow(name, tasks).await
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> ConvoyResult<Workflow> {
        self.workflows.status(workflow_id).await
    }

    pub async fn list_workflows(&self) -> ConvoyResult<Vec<WorkflowSummary>> {
        self.workflows.list().await
    }

    // --- results ---

    pub async fn show_result(&self, task_id: &str) -> ConvoyResult<TaskResult> {
        self.results.show(task_id).await
    }

    pub async fn aggregate_results(&self, task_ids: &[String]) -> ConvoyResult<Aggregate> {
        self.results.aggregate(task_ids).await
    }

    pub async fn show_aggregate(&self, aggregate_id: &str) -> ConvoyResult<Aggregate> {
        self.results.get_aggregate(aggregate_id).await
    }

    // --- system ---

    /// Remove archived tasks and results older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u64) -> ConvoyResult<usize> {
        self.queue
            .cleanup(Duration::from_secs(retention_days.saturating_mul(DAY)))
            .await
    }

    pub async fn stats(&self) -> ConvoyResult<SystemStats> {
        let mut stats = SystemStats::default();
        for agent in self.registry.agents().await? {
            if agent.is_active() {
                stats.agents_active += 1;
            } else {
                stats.agents_inactive += 1;
            }
        }
        for task in self.queue.list(None).await? {
            match task.status {
                TaskStatus::Pending => stats.tasks_pending += 1,
                TaskStatus::Assigned => stats.tasks_assigned += 1,
                TaskStatus::Completed => stats.tasks_completed += 1,
                TaskStatus::Failed => stats.tasks_failed += 1,
            }
        }
        stats.workflows = self.workflows.count().await?;
        stats.results = self.results.count().await?;
        Ok(stats)
    }
}
