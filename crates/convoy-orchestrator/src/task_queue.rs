use crate::lock::{task_lock, LockManager};
use crate::registry::AgentRegistry;
use crate::results::ResultStore;
use crate::types::{window_start, FailOutcome, NewTask, Task, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use convoy_core::{new_task_id, ConvoyError, ConvoyResult};
use convoy_store::{insert, load, load_all, save, Collection, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Durable priority queue of tasks.
///
/// Pending and assigned tasks live in [`Collection::Tasks`]; completed and
/// terminally failed ones are moved to [`Collection::TaskArchive`] and never
/// change again. Every state transition holds the task's own lock.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    registry: Arc<AgentRegistry>,
    results: ResultStore,
    default_max_attempts: u32,
    wake: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<LockManager>,
        registry: Arc<AgentRegistry>,
        results: ResultStore,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            results,
            default_max_attempts: 3,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Retry budget for submissions that do not set one.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Fires whenever a task becomes pending in this process.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Validate and enqueue a new task. Returns its id.
    pub async fn submit(&self, new: NewTask) -> ConvoyResult<String> {
        self.submit_for_workflow(new, None).await
    }

    pub(crate) async fn submit_for_workflow(
        &self,
        new: NewTask,
        workflow_id: Option<&str>,
    ) -> ConvoyResult<String> {
        self.validate(&new)?;
        let max_attempts = new.max_attempts.unwrap_or(self.default_max_attempts);

        let task = Task {
            id: new_task_id(),
            task_type: new.task_type,
            payload: new.payload,
            required_capability: new.required_capability,
            priority: new.priority,
            status: TaskStatus::Pending,
            submitted_at: Utc::now(),
            assigned_agent: None,
            assigned_at: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            finished_at: None,
            workflow_id: workflow_id.map(str::to_string),
        };
        if !insert(self.store.as_ref(), Collection::Tasks, &task.id, &task).await? {
            return Err(ConvoyError::Storage(format!("Task id collision: {}", task.id)));
        }

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            capability = %task.required_capability,
            priority = task.priority,
            "Task submitted"
        );
        self.wake.notify_waiters();
        Ok(task.id)
    }

    /// Check a submission without enqueuing it.
    pub fn validate(&self, new: &NewTask) -> ConvoyResult<()> {
        validate_submission(new, new.max_attempts.unwrap_or(self.default_max_attempts))
    }

    /// Best pending task `agent_id` can run: highest priority, then earliest
    /// submission, then lowest id.
    pub async fn next_for(&self, agent_id: &str) -> ConvoyResult<Option<String>> {
        let agent = self.registry.require(agent_id).await?;
        let best = self
            .active()
            .await?
            .into_iter()
            .filter(|t| t.is_pending() && agent.can_run(&t.required_capability))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.submitted_at.cmp(&b.submitted_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
        Ok(best.map(|t| t.id))
    }

    /// Claim a pending task for `agent_id`. Exactly one concurrent caller
    /// wins; the others get [`ConvoyError::AlreadyAssigned`].
    pub async fn assign(&self, task_id: &str, agent_id: &str) -> ConvoyResult<Task> {
        let agent = self.registry.require(agent_id).await?;

        let task = self
            .locks
            .with_lock(&task_lock(task_id), || async {
                let Some(mut task) = self.load_active(task_id).await? else {
                    let err = ConvoyError::AlreadyAssigned(task_id.into());
                    return Err(self.absent(task_id, err).await?);
                };
                if !task.is_pending() {
                    return Err(ConvoyError::AlreadyAssigned(task_id.to_string()));
                }
                if !agent.can_run(&task.required_capability) {
                    return Err(ConvoyError::Validation(format!(
                        "Agent {agent_id} lacks capability '{}'",
                        task.required_capability
                    )));
                }
                task.status = TaskStatus::Assigned;
                task.assigned_agent = Some(agent_id.to_string());
                task.assigned_at = Some(Utc::now());
                save(self.store.as_ref(), Collection::Tasks, task_id, &task).await?;
                Ok(task)
            })
            .await?;

        info!(task_id, agent_id, "Task assigned");
        Ok(task)
    }

    /// Record a successful run: store the result, archive the task as
    /// completed and bump the agent's counter.
    pub async fn complete(
        &self,
        task_id: &str,
        agent_id: &str,
        result: serde_json::Value,
    ) -> ConvoyResult<TaskResult> {
        let stored = self
            .locks
            .with_lock(&task_lock(task_id), || async {
                let mut task = self.load_held(task_id, agent_id).await?;
                let now = Utc::now();
                let stored = TaskResult {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.to_string(),
                    result,
                    completed_at: now,
                };
                self.results.record(&stored).await?;

                task.status = TaskStatus::Completed;
                task.finished_at = Some(now);
                self.archive(&task).await?;
                Ok(stored)
            })
            .await?;

        info!(task_id, agent_id, "Task completed");
        self.note_outcome(agent_id, true).await;
        Ok(stored)
    }

    /// Record a failed run. The task goes back to pending while it has
    /// attempts left, otherwise it is archived as failed.
    pub async fn fail(
        &self,
        task_id: &str,
        agent_id: &str,
        error: &str,
    ) -> ConvoyResult<FailOutcome> {
        let outcome = self
            .locks
            .with_lock(&task_lock(task_id), || async {
                let mut task = self.load_held(task_id, agent_id).await?;
                task.attempts += 1;
                task.last_error = Some(error.to_string());

                if task.attempts < task.max_attempts {
                    task.status = TaskStatus::Pending;
                    task.assigned_agent = None;
                    task.assigned_at = None;
                    save(self.store.as_ref(), Collection::Tasks, task_id, &task).await?;
                    Ok(FailOutcome::Requeued {
                        attempts: task.attempts,
                    })
                } else {
                    task.status = TaskStatus::Failed;
                    task.finished_at = Some(Utc::now());
                    self.archive(&task).await?;
                    Ok(FailOutcome::Exhausted {
                        attempts: task.attempts,
                    })
                }
            })
            .await?;

        match outcome {
            FailOutcome::Requeued { attempts } => {
                warn!(task_id, agent_id, attempts, error, "Task failed, requeued");
                self.wake.notify_waiters();
            }
            FailOutcome::Exhausted { attempts } => {
                warn!(task_id, agent_id, attempts, error, "Task failed permanently");
            }
        }
        self.note_outcome(agent_id, false).await;
        Ok(outcome)
    }

    /// Remove a pending task.
    pub async fn cancel(&self, task_id: &str) -> ConvoyResult<()> {
        self.locks
            .with_lock(&task_lock(task_id), || async {
                let Some(task) = self.load_active(task_id).await? else {
                    let err = ConvoyError::NotPending(task_id.into());
                    return Err(self.absent(task_id, err).await?);
                };
                if !task.is_pending() {
                    return Err(ConvoyError::NotPending(task_id.to_string()));
                }
                self.store.delete(Collection::Tasks, task_id).await?;
                Ok(())
            })
            .await?;
        info!(task_id, "Task cancelled");
        Ok(())
    }

    /// Full record of a task, active or archived.
    pub async fn get(&self, task_id: &str) -> ConvoyResult<Task> {
        self.find(task_id)
            .await?
            .ok_or_else(|| ConvoyError::TaskNotFound(task_id.to_string()))
    }

    pub async fn find(&self, task_id: &str) -> ConvoyResult<Option<Task>> {
        if let Some(task) = self.load_active(task_id).await? {
            return Ok(Some(task));
        }
        load(self.store.as_ref(), Collection::TaskArchive, task_id).await
    }

    /// Active and archived tasks in submission order, optionally filtered.
    pub async fn list(&self, status: Option<TaskStatus>) -> ConvoyResult<Vec<Task>> {
        // Active before archive: a task archived in between is still seen
        // once. An active copy wins over a leftover archived one.
        let mut by_id: BTreeMap<String, Task> = BTreeMap::new();
        for task in self.active().await? {
            by_id.insert(task.id.clone(), task);
        }
        for task in load_all::<Task>(self.store.as_ref(), Collection::TaskArchive).await? {
            by_id.entry(task.id.clone()).or_insert(task);
        }
        let mut tasks: Vec<Task> = by_id
            .into_values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Tasks currently held by some agent.
    pub async fn assigned(&self) -> ConvoyResult<Vec<Task>> {
        Ok(self
            .active()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Assigned)
            .collect())
    }

    /// Delete archived tasks, and their results, that finished more than
    /// `retention` ago. Returns how many tasks were removed.
    pub async fn cleanup(&self, retention: Duration) -> ConvoyResult<usize> {
        // A window reaching past the earliest representable time keeps everything.
        let Some(cutoff) = window_start(retention) else {
            return Ok(0);
        };
        let mut removed = 0;
        for task in load_all::<Task>(self.store.as_ref(), Collection::TaskArchive).await? {
            if !task.finished_at.is_some_and(|at| at < cutoff) {
                continue;
            }
            let deleted = self
                .locks
                .with_lock(&task_lock(&task.id), || async {
                    self.results.remove(&task.id).await?;
                    self.store.delete(Collection::TaskArchive, &task.id).await
                })
                .await?;
            if deleted {
                debug!(task_id = %task.id, status = %task.status, "Archived task removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Archive cleanup finished");
        }
        Ok(removed)
    }

    /// Put terminally failed tasks that finished within `max_age` back in
    /// the queue with a fresh retry budget. Returns how many were requeued.
    pub async fn retry_failed(&self, max_age: Duration) -> ConvoyResult<usize> {
        let cutoff = window_start(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut requeued = 0;
        for task in load_all::<Task>(self.store.as_ref(), Collection::TaskArchive).await? {
            let recent = task.finished_at.is_some_and(|at| at >= cutoff);
            if task.status != TaskStatus::Failed || !recent {
                continue;
            }
            let moved = self
                .locks
                .with_lock(&task_lock(&task.id), || async {
                    let Some(mut task) =
                        load::<Task>(self.store.as_ref(), Collection::TaskArchive, &task.id).await?
                    else {
                        return Ok(false);
                    };
                    task.status = TaskStatus::Pending;
                    task.attempts = 0;
                    task.assigned_agent = None;
                    task.assigned_at = None;
                    task.finished_at = None;
                    if !insert(self.store.as_ref(), Collection::Tasks, &task.id, &task).await? {
                        return Ok(false);
                    }
                    self.store.delete(Collection::TaskArchive, &task.id).await?;
                    Ok(true)
                })
                .await?;
            if moved {
                info!(task_id = %task.id, "Failed task requeued");
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.wake.notify_waiters();
        }
        Ok(requeued)
    }

    async fn active(&self) -> ConvoyResult<Vec<Task>> {
        load_all(self.store.as_ref(), Collection::Tasks).await
    }

    async fn load_active(&self, task_id: &str) -> ConvoyResult<Option<Task>> {
        load(self.store.as_ref(), Collection::Tasks, task_id).await
    }

    /// Active task held by `agent_id`, or the error explaining why not.
    async fn load_held(&self, task_id: &str, agent_id: &str) -> ConvoyResult<Task> {
        let not_assigned = || ConvoyError::NotAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        };
        match self.load_active(task_id).await? {
            Some(task) if task.is_held_by(agent_id) => Ok(task),
            Some(_) => Err(not_assigned()),
            None => Err(self.absent(task_id, not_assigned()).await?),
        }
    }

    /// Error for a task missing from the active set: `if_archived` when it
    /// has already finished, not-found otherwise.
    async fn absent(&self, task_id: &str, if_archived: ConvoyError) -> ConvoyResult<ConvoyError> {
        let archived = self.store.get(Collection::TaskArchive, task_id).await?;
        Ok(if archived.is_some() {
            if_archived
        } else {
            ConvoyError::TaskNotFound(task_id.to_string())
        })
    }

    /// Archive first, then drop the active copy, so a reader never sees the
    /// task vanish.
    async fn archive(&self, task: &Task) -> ConvoyResult<()> {
        save(self.store.as_ref(), Collection::TaskArchive, &task.id, task).await?;
        self.store.delete(Collection::Tasks, &task.id).await?;
        Ok(())
    }

    async fn note_outcome(&self, agent_id: &str, success: bool) {
        if let Err(e) = self.registry.record_outcome(agent_id, success).await {
            warn!(agent_id, error = %e, "Failed to update agent counters");
        }
    }
}

fn validate_submission(new: &NewTask, max_attempts: u32) -> ConvoyResult<()> {
    if new.task_type.trim().is_empty() {
        return Err(ConvoyError::Validation("Task type must not be empty".into()));
    }
    if new.required_capability.trim().is_empty() {
        return Err(ConvoyError::Validation(
            "Required capability must not be empty".into(),
        ));
    }
    if !(1..=10).contains(&new.priority) {
        return Err(ConvoyError::Validation(format!(
            "Priority must be between 1 and 10, got {}",
            new.priority
        )));
    }
    if max_attempts == 0 {
        return Err(ConvoyError::Validation("max_attempts must be at least 1".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_store::MemoryStore;

    struct Fixture {
        store: Arc<dyn Store>,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockManager::new(store.clone()));
        let registry = Arc::new(AgentRegistry::new(store.clone(), locks.clone()));
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            locks,
            registry.clone(),
            ResultStore::new(store.clone()),
        ));
        Fixture {
            store,
            registry,
            queue,
        }
    }

    fn scan(capability: &str, priority: u8) -> NewTask {
        NewTask::new("scan", serde_json::json!({"target": "10.0.0.1"}))
            .with_capability(capability)
            .with_priority(priority)
    }

    // ----- 1. Submission -----

    #[tokio::test]
    async fn test_submit_creates_pending_task() {
        let f = fixture();
        let id = f.queue.submit(scan("recon", 8)).await.unwrap();
        let task = f.queue.get(&id).await.unwrap();
        assert!(id.starts_with("task-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 8);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.attempts, 0);
        assert!(task.assigned_agent.is_none());
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let f = fixture();
        for bad in [
            scan("recon", 0),
            scan("recon", 11),
            scan("", 5),
            NewTask::new(" ", serde_json::Value::Null),
            scan("recon", 5).with_max_attempts(0),
        ] {
            let err = f.queue.submit(bad).await.unwrap_err();
            assert!(matches!(err, ConvoyError::Validation(_)), "got {err:?}");
        }
        assert!(f.queue.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_distinct_ids() {
        let f = fixture();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let queue = f.queue.clone();
            handles.push(tokio::spawn(async move {
                queue.submit(scan("any", 5)).await.unwrap()
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(f.queue.list(None).await.unwrap().len(), 32);
    }

    // ----- 2. Selection -----

    #[tokio::test]
    async fn test_next_for_prefers_priority_then_age() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let low = f.queue.submit(scan("recon", 3)).await.unwrap();
        let high = f.queue.submit(scan("recon", 9)).await.unwrap();
        let high_later = f.queue.submit(scan("recon", 9)).await.unwrap();

        assert_eq!(f.queue.next_for("a1").await.unwrap(), Some(high.clone()));
        f.queue.assign(&high, "a1").await.unwrap();
        assert_eq!(f.queue.next_for("a1").await.unwrap(), Some(high_later.clone()));
        f.queue.assign(&high_later, "a1").await.unwrap();
        assert_eq!(f.queue.next_for("a1").await.unwrap(), Some(low));
    }

    #[tokio::test]
    async fn test_next_for_respects_capabilities() {
        let f = fixture();
        f.registry.register("a1", ["report"]).await.unwrap();
        f.queue.submit(scan("recon", 10)).await.unwrap();
        assert!(f.queue.next_for("a1").await.unwrap().is_none());

        let wildcard = f.queue.submit(scan("any", 1)).await.unwrap();
        assert_eq!(f.queue.next_for("a1").await.unwrap(), Some(wildcard));
    }

    #[tokio::test]
    async fn test_next_for_unknown_agent() {
        let f = fixture();
        let err = f.queue.next_for("ghost").await.unwrap_err();
        assert!(matches!(err, ConvoyError::AgentNotFound(_)));
    }

    // ----- 3. Assignment -----

    #[tokio::test]
    async fn test_concurrent_assign_has_single_winner() {
        let f = fixture();
        let id = f.queue.submit(scan("any", 5)).await.unwrap();
        for i in 0..6 {
            f.registry.register(&format!("a{i}"), ["recon"]).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..6 {
            let queue = f.queue.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                queue.assign(&id, &format!("a{i}")).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, ConvoyError::AlreadyAssigned(_)), "got {e:?}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_assign_missing_task() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let err = f.queue.assign("task-missing", "a1").await.unwrap_err();
        assert!(matches!(err, ConvoyError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_assign_requires_capability() {
        let f = fixture();
        f.registry.register("a1", ["report"]).await.unwrap();
        let id = f.queue.submit(scan("recon", 5)).await.unwrap();
        let err = f.queue.assign(&id, "a1").await.unwrap_err();
        assert!(matches!(err, ConvoyError::Validation(_)));
        assert!(f.queue.get(&id).await.unwrap().is_pending());
    }

    // ----- 4. Completion and failure -----

    #[tokio::test]
    async fn test_complete_archives_and_stores_result() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let id = f.queue.submit(scan("recon", 8)).await.unwrap();
        f.queue.assign(&id, "a1").await.unwrap();
        f.queue
            .complete(&id, "a1", serde_json::json!({"ports": [22, 80]}))
            .await
            .unwrap();

        let task = f.queue.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.finished_at.is_some());
        assert!(f.store.get(Collection::Tasks, &id).await.unwrap().is_none());

        let result = ResultStore::new(f.store.clone()).show(&id).await.unwrap();
        assert_eq!(result.agent_id, "a1");
        assert_eq!(result.result["ports"][1], 80);
        assert_eq!(f.registry.require("a1").await.unwrap().tasks_completed, 1);

        // A second report for a finished task is rejected.
        let err = f.queue.complete(&id, "a1", serde_json::json!(null)).await.unwrap_err();
        assert!(matches!(err, ConvoyError::NotAssigned { .. }));
    }

    #[tokio::test]
    async fn test_complete_by_other_agent_is_rejected() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        f.registry.register("a2", ["recon"]).await.unwrap();
        let id = f.queue.submit(scan("recon", 5)).await.unwrap();
        f.queue.assign(&id, "a1").await.unwrap();

        let err = f.queue.complete(&id, "a2", serde_json::json!(1)).await.unwrap_err();
        assert!(matches!(err, ConvoyError::NotAssigned { .. }));
        assert!(f.queue.get(&id).await.unwrap().is_held_by("a1"));
    }

    #[tokio::test]
    async fn test_fail_requeues_until_exhausted() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let id = f
            .queue
            .submit(scan("recon", 5).with_max_attempts(3))
            .await
            .unwrap();

        let mut transitions = 0;
        loop {
            f.queue.assign(&id, "a1").await.unwrap();
            transitions += 1;
            match f.queue.fail(&id, "a1", "boom").await.unwrap() {
                FailOutcome::Requeued { attempts } => {
                    assert_eq!(attempts, transitions);
                    let task = f.queue.get(&id).await.unwrap();
                    assert!(task.is_pending());
                    assert!(task.assigned_agent.is_none());
                }
                FailOutcome::Exhausted { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
            }
        }
        assert_eq!(transitions, 3);

        let task = f.queue.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert_eq!(f.registry.require("a1").await.unwrap().tasks_failed, 3);
    }

    #[tokio::test]
    async fn test_fail_wakes_waiters() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let id = f.queue.submit(scan("recon", 5)).await.unwrap();
        f.queue.assign(&id, "a1").await.unwrap();

        let wake = f.queue.wake_handle();
        let notified = wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        f.queue.fail(&id, "a1", "boom").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .unwrap();
    }

    // ----- 5. Cancellation -----

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let pending = f.queue.submit(scan("recon", 5)).await.unwrap();
        let held = f.queue.submit(scan("recon", 5)).await.unwrap();
        f.queue.assign(&held, "a1").await.unwrap();

        f.queue.cancel(&pending).await.unwrap();
        assert!(matches!(
            f.queue.get(&pending).await.unwrap_err(),
            ConvoyError::TaskNotFound(_)
        ));
        assert!(matches!(
            f.queue.cancel(&held).await.unwrap_err(),
            ConvoyError::NotPending(_)
        ));
        assert!(matches!(
            f.queue.cancel("task-missing").await.unwrap_err(),
            ConvoyError::TaskNotFound(_)
        ));
    }

    // ----- 6. Listing, cleanup and retry -----

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let done = f.queue.submit(scan("recon", 5)).await.unwrap();
        let waiting = f.queue.submit(scan("recon", 5)).await.unwrap();
        f.queue.assign(&done, "a1").await.unwrap();
        f.queue.complete(&done, "a1", serde_json::json!({})).await.unwrap();

        let all: Vec<String> =
            f.queue.list(None).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(all, vec![done.clone(), waiting.clone()]);
        let completed = f.queue.list(Some(TaskStatus::Completed)).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done);
        let pending = f.queue.list(Some(TaskStatus::Pending)).await.unwrap();
        assert_eq!(pending[0].id, waiting);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_archive_and_results() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let id = f.queue.submit(scan("recon", 5)).await.unwrap();
        let open = f.queue.submit(scan("recon", 5)).await.unwrap();
        f.queue.assign(&id, "a1").await.unwrap();
        f.queue.complete(&id, "a1", serde_json::json!({})).await.unwrap();

        assert_eq!(f.queue.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.queue.cleanup(Duration::from_millis(5)).await.unwrap(), 1);

        assert!(f.queue.find(&id).await.unwrap().is_none());
        assert!(f.store.get(Collection::Results, &id).await.unwrap().is_none());
        assert!(f.queue.find(&open).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_failed_resets_attempts() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let id = f
            .queue
            .submit(scan("recon", 5).with_max_attempts(1))
            .await
            .unwrap();
        f.queue.assign(&id, "a1").await.unwrap();
        f.queue.fail(&id, "a1", "boom").await.unwrap();

        assert_eq!(f.queue.retry_failed(Duration::from_secs(3600)).await.unwrap(), 1);
        let task = f.queue.get(&id).await.unwrap();
        assert!(task.is_pending());
        assert_eq!(task.attempts, 0);
        assert!(task.finished_at.is_none());
        assert!(f.store.get(Collection::TaskArchive, &id).await.unwrap().is_none());

        // Nothing left to retry.
        assert_eq!(f.queue.retry_failed(Duration::from_secs(3600)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_huge_windows_do_not_overflow() {
        let f = fixture();
        f.registry.register("a1", ["recon"]).await.unwrap();
        let done = f.queue.submit(scan("recon", 5)).await.unwrap();
        let failed = f
            .queue
            .submit(scan("recon", 5).with_max_attempts(1))
            .await
            .unwrap();
        f.queue.assign(&done, "a1").await.unwrap();
        f.queue.complete(&done, "a1", serde_json::json!({})).await.unwrap();
        f.queue.assign(&failed, "a1").await.unwrap();
        f.queue.fail(&failed, "a1", "boom").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let huge = Duration::from_secs(1_000_000_000 * 86_400);
        // Retention longer than representable time keeps everything.
        assert_eq!(f.queue.cleanup(huge).await.unwrap(), 0);
        assert_eq!(f.queue.cleanup(Duration::MAX).await.unwrap(), 0);
        assert!(f.queue.find(&done).await.unwrap().is_some());

        // A max age that long covers every failure.
        assert_eq!(f.queue.retry_failed(huge).await.unwrap(), 1);
        assert!(f.queue.get(&failed).await.unwrap().is_pending());
    }
}
