use thiserror::Error;

/// A convenience `Result` alias using [`ConvoyError`].
pub type ConvoyResult<T> = Result<T, ConvoyError>;

/// Top-level error type for the Convoy engine.
///
/// Variants are grouped by how a caller is expected to react to them; see
/// [`ConvoyError::class`].
#[derive(Error, Debug)]
pub enum ConvoyError {
    /// An agent id that does not match the identifier grammar.
    #[error("Invalid agent id: '{0}'")]
    InvalidAgentId(String),

    /// Any other rejected input (bad priority, empty name, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// No agent record with this id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The id is held by an active agent of another process.
    #[error("Agent already registered: {0}")]
    AgentExists(String),

    /// No task record with this id (active or archived).
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The task is no longer pending; another agent claimed it first.
    #[error("Task already assigned: {0}")]
    AlreadyAssigned(String),

    /// The task is not assigned to the agent reporting on it.
    #[error("Task {task_id} is not assigned to agent {agent_id}")]
    NotAssigned {
        /// Task being reported on.
        task_id: String,
        /// Agent that tried to report.
        agent_id: String,
    },

    /// Only pending tasks can be cancelled.
    #[error("Task is not pending: {0}")]
    NotPending(String),

    /// No workflow record with this id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No stored result for this task.
    #[error("Result not found: {0}")]
    ResultNotFound(String),

    /// No aggregate record with this id.
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(String),

    /// The named lock could not be taken before the timeout elapsed.
    #[error("Timed out acquiring lock '{0}'")]
    LockTimeout(String),

    /// A release was attempted by someone other than the lock's owner.
    #[error("Lock '{name}' is owned by {owner}")]
    LockNotOwner {
        /// Lock name.
        name: String,
        /// Identity recorded on the lock.
        owner: String,
    },

    /// A release was attempted on a lock that does not exist.
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// A task handler reported an execution failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A backing-store failure not covered by the I/O and JSON variants.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`ConvoyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected input; retrying the same call cannot succeed.
    Validation,
    /// The referenced record does not exist.
    NotFound,
    /// Expected under concurrency; re-read and try again.
    Contention,
    /// A task body failed; subject to the task's retry budget.
    Execution,
    /// Backing store, serialization or configuration trouble.
    Storage,
}

impl ConvoyError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAgentId(_) | Self::Validation(_) | Self::NotPending(_) => {
                ErrorClass::Validation
            }
            Self::AgentNotFound(_)
            | Self::TaskNotFound(_)
            | Self::WorkflowNotFound(_)
            | Self::ResultNotFound(_)
            | Self::AggregateNotFound(_)
            | Self::LockNotFound(_) => ErrorClass::NotFound,
            Self::AgentExists(_)
            | Self::AlreadyAssigned(_)
            | Self::NotAssigned { .. }
            | Self::LockTimeout(_)
            | Self::LockNotOwner { .. } => ErrorClass::Contention,
            Self::Handler(_) => ErrorClass::Execution,
            Self::Storage(_) | Self::Config(_) | Self::Json(_) | Self::Io(_) => {
                ErrorClass::Storage
            }
        }
    }

    /// Whether the caller should retry the read-then-act sequence.
    pub fn is_contention(&self) -> bool {
        self.class() == ErrorClass::Contention
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            ConvoyError::InvalidAgentId("a b".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            ConvoyError::TaskNotFound("t".into()).class(),
            ErrorClass::NotFound
        );
        assert!(ConvoyError::AlreadyAssigned("t".into()).is_contention());
        assert!(ConvoyError::LockTimeout("registry".into()).is_contention());
        assert_eq!(
            ConvoyError::Handler("boom".into()).class(),
            ErrorClass::Execution
        );
        assert!(!ConvoyError::Storage("disk".into()).is_contention());
    }

    #[test]
    fn test_display_not_assigned() {
        let err = ConvoyError::NotAssigned {
            task_id: "task-1".into(),
            agent_id: "a1".into(),
        };
        assert_eq!(err.to_string(), "Task task-1 is not assigned to agent a1");
    }
}
