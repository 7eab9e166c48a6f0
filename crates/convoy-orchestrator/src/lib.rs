//! Multi-process task orchestration engine.
//!
//! Agents register their capabilities, pull tasks from a durable priority
//! queue, run them and report back. A controller loop expires silent agents
//! and takes their tasks back. All state lives in a shared
//! [`convoy_store::Store`]; named locks on top of it keep concurrent
//! processes from stepping on each other.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Facade wiring every component on one store.
//! - [`LockManager`]: Named, owner-attributed locks with timeouts.
//! - [`AgentRegistry`]: Agent registration, heartbeats and liveness.
//! - [`TaskQueue`]: Submission, claiming, completion and retries.
//! - [`Controller`]: Periodic reconciliation of dead agents and old records.
//! - [`AgentRuntime`]: Worker loop driving a [`HandlerRegistry`].
//! - [`WorkflowCoordinator`]: Groups of tasks with a combined status.
//! - [`ResultStore`]: Stored task results and aggregates.

/// Reconciliation loop.
pub mod controller;
/// Orchestrator facade.
pub mod engine;
/// Named locks on top of the store.
pub mod lock;
/// Agent registry.
pub mod registry;
/// Task results and aggregates.
pub mod results;
/// Agent worker loop and task handlers.
pub mod runtime;
/// Durable task queue.
pub mod task_queue;
/// Shared record types.
pub mod types;
/// Workflow coordination.
pub mod workflow;

pub use controller::{Controller, TickReport, AGENT_TIMEOUT};
pub use engine::Orchestrator;
pub use lock::{LockManager, LockRecord};
pub use registry::AgentRegistry;
pub use results::ResultStore;
pub use runtime::{AgentRuntime, CycleOutcome, HandlerRegistry, TaskHandler};
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentStatus, Aggregate, FailOutcome, NewTask, RegistryStatus, SystemStats, Task,
    TaskResult, TaskStatus, TaskSummary, Workflow, WorkflowStatus, WorkflowSummary,
};
pub use workflow::WorkflowCoordinator;
