use crate::lock::{workflow_lock, LockManager};
use crate::task_queue::TaskQueue;
use crate::types::{NewTask, TaskStatus, Workflow, WorkflowStatus, WorkflowSummary};
use chrono::Utc;
use convoy_core::{new_workflow_id, ConvoyError, ConvoyResult};
use convoy_store::{insert, load, load_all, save, Collection, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Submits named groups of tasks and derives their combined status.
///
/// Every task of a workflow is submitted up front; there is no ordering
/// between them. The workflow record only caches what was last observed.
pub struct WorkflowCoordinator {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    queue: Arc<TaskQueue>,
}

impl WorkflowCoordinator {
    pub fn new(store: Arc<dyn Store>, locks: Arc<LockManager>, queue: Arc<TaskQueue>) -> Self {
        Self {
            store,
            locks,
            queue,
        }
    }

    /// Submit every definition and record the workflow. Returns its id.
    pub async fn submit_workflow(&self, name: &str, tasks: Vec<NewTask>) -> ConvoyResult<String> {
        if name.trim().is_empty() {
            return Err(ConvoyError::Validation("Workflow name must not be empty".into()));
        }
        if tasks.is_empty() {
            return Err(ConvoyError::Validation(format!(
                "Workflow '{name}' has no tasks"
            )));
        }
        // Reject the whole workflow before anything is enqueued.
        for task in &tasks {
            self.queue.validate(task)?;
        }

        let id = new_workflow_id();
        let mut task_ids = Vec::with_capacity(tasks.len());
        for task in &tasks {
            task_ids.push(
                self.queue
                    .submit_for_workflow(task.clone(), Some(&id))
                    .await?,
            );
        }

        let workflow = Workflow {
            id: id.clone(),
            name: name.to_string(),
            status: WorkflowStatus::Running,
            tasks,
            task_ids,
            submitted_at: Utc::now(),
            completed_tasks: Default::default(),
            failed_tasks: Default::default(),
            finished_at: None,
        };
        if !insert(self.store.as_ref(), Collection::Workflows, &id, &workflow).await? {
            return Err(ConvoyError::Storage(format!("Workflow id collision: {id}")));
        }

        info!(
            workflow_id = %id,
            name,
            tasks = workflow.task_ids.len(),
            "Workflow submitted"
        );
        Ok(id)
    }

    /// Re-read the constituent tasks and return the up-to-date record.
    pub async fn status(&self, workflow_id: &str) -> ConvoyResult<Workflow> {
        self.locks
            .with_lock(&workflow_lock(workflow_id), || async {
                let mut workflow: Workflow =
                    load(self.store.as_ref(), Collection::Workflows, workflow_id)
                        .await?
                        .ok_or_else(|| ConvoyError::WorkflowNotFound(workflow_id.to_string()))?;
                if workflow.status.is_terminal() {
                    return Ok(workflow);
                }

                if self.observe(&mut workflow).await? {
                    save(self.store.as_ref(), Collection::Workflows, workflow_id, &workflow).await?;
                }
                Ok(workflow)
            })
            .await
    }

    /// Summaries of every workflow, oldest first. Running workflows are
    /// refreshed; one whose lock is busy is reported as last stored.
    pub async fn list(&self) -> ConvoyResult<Vec<WorkflowSummary>> {
        let mut workflows: Vec<Workflow> =
            load_all(self.store.as_ref(), Collection::Workflows).await?;
        workflows.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));

        let mut summaries = Vec::with_capacity(workflows.len());
        for workflow in workflows {
            if workflow.status.is_terminal() {
                summaries.push(workflow.summary());
                continue;
            }
            match self.status(&workflow.id).await {
                Ok(fresh) => summaries.push(fresh.summary()),
                Err(e) if e.is_contention() => {
                    debug!(workflow_id = %workflow.id, "Workflow busy, listing stored status");
                    summaries.push(workflow.summary());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    pub async fn count(&self) -> ConvoyResult<usize> {
        Ok(self.store.list(Collection::Workflows).await?.len())
    }

    /// Fold the current task states into `workflow`. Returns whether
    /// anything changed.
    async fn observe(&self, workflow: &mut Workflow) -> ConvoyResult<bool> {
        let before = (
            workflow.status,
            workflow.completed_tasks.len(),
            workflow.failed_tasks.len(),
        );

        for task_id in &workflow.task_ids {
            let settled = workflow.completed_tasks.contains(task_id)
                || workflow.failed_tasks.contains(task_id);
            if settled {
                continue;
            }
            match self.queue.find(task_id).await? {
                Some(task) if task.status == TaskStatus::Completed => {
                    workflow.completed_tasks.insert(task_id.clone());
                }
                Some(task) if task.status == TaskStatus::Failed => {
                    workflow.failed_tasks.insert(task_id.clone());
                }
                Some(_) => {}
                None => {
                    warn!(
                        workflow_id = %workflow.id,
                        task_id = %task_id,
                        "Workflow task disappeared before completing, counting it as failed"
                    );
                    workflow.failed_tasks.insert(task_id.clone());
                }
            }
        }

        workflow.status = if !workflow.failed_tasks.is_empty() {
            WorkflowStatus::Failed
        } else if workflow.completed_tasks.len() == workflow.task_ids.len() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Running
        };
        if workflow.status.is_terminal() {
            workflow.finished_at = Some(Utc::now());
            info!(workflow_id = %workflow.id, status = %workflow.status, "Workflow finished");
        }

        Ok(before
            != (
                workflow.status,
                workflow.completed_tasks.len(),
                workflow.failed_tasks.len(),
            ))
    }
}
