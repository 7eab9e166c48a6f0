use crate::types::{Aggregate, TaskResult};
use chrono::Utc;
use convoy_core::{new_aggregate_id, ConvoyError, ConvoyResult};
use convoy_store::{insert, load, Collection, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable task results and the aggregates built from them.
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn Store>,
}

impl ResultStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Write a result once. A second write for the same task is ignored and
    /// the first one kept; returns whether this call wrote it.
    pub(crate) async fn record(&self, result: &TaskResult) -> ConvoyResult<bool> {
        let written = insert(
            self.store.as_ref(),
            Collection::Results,
            &result.task_id,
            result,
        )
        .await?;
        if !written {
            warn!(task_id = %result.task_id, "Result already stored, keeping the first one");
        }
        Ok(written)
    }

    pub(crate) async fn remove(&self, task_id: &str) -> ConvoyResult<bool> {
        self.store.delete(Collection::Results, task_id).await
    }

    /// The stored result of one completed task.
    pub async fn show(&self, task_id: &str) -> ConvoyResult<TaskResult> {
        load(self.store.as_ref(), Collection::Results, task_id)
            .await?
            .ok_or_else(|| ConvoyError::ResultNotFound(task_id.to_string()))
    }

    /// Combine the results of `task_ids` into one stored record, in request
    /// order. Ids without a result are listed in `missing` instead.
    pub async fn aggregate(&self, task_ids: &[String]) -> ConvoyResult<Aggregate> {
        if task_ids.is_empty() {
            return Err(ConvoyError::Validation(
                "Aggregate needs at least one task id".into(),
            ));
        }

        let mut results = Vec::with_capacity(task_ids.len());
        let mut missing = Vec::new();
        for task_id in task_ids {
            match load::<TaskResult>(self.store.as_ref(), Collection::Results, task_id).await? {
                Some(result) => results.push(result),
                None => {
                    debug!(task_id = %task_id, "No result to aggregate");
                    missing.push(task_id.clone());
                }
            }
        }

        let aggregate = Aggregate {
            id: new_aggregate_id(),
            created_at: Utc::now(),
            requested: task_ids.to_vec(),
            results,
            missing,
        };
        if !insert(
            self.store.as_ref(),
            Collection::Aggregates,
            &aggregate.id,
            &aggregate,
        )
        .await?
        {
            return Err(ConvoyError::Storage(format!(
                "Aggregate id collision: {}",
                aggregate.id
            )));
        }

        info!(
            aggregate_id = %aggregate.id,
            found = aggregate.results.len(),
            missing = aggregate.missing.len(),
            "Results aggregated"
        );
        Ok(aggregate)
    }

    pub async fn get_aggregate(&self, aggregate_id: &str) -> ConvoyResult<Aggregate> {
        load(self.store.as_ref(), Collection::Aggregates, aggregate_id)
            .await?
            .ok_or_else(|| ConvoyError::AggregateNotFound(aggregate_id.to_string()))
    }

    /// Number of stored results.
    pub async fn count(&self) -> ConvoyResult<usize> {
        Ok(self.store.list(Collection::Results).await?.len())
    }
}
