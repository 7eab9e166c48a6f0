//! Core types and error definitions for the Convoy task orchestrator.
//!
//! This crate provides the foundational pieces shared by every Convoy crate:
//! the error taxonomy, the TOML configuration model and identifier helpers.
//!
//! # Main types
//!
//! - [`ConvoyError`]: Unified error enum for all Convoy subsystems.
//! - [`ConvoyResult`]: Convenience alias for `Result<T, ConvoyError>`.
//! - [`ErrorClass`]: How a caller should react to an error.
//! - [`ConvoyConfig`]: Root of the `convoy.toml` configuration.

/// Configuration model.
pub mod config;
/// Error types.
pub mod error;
/// Identifier validation and generation.
pub mod id;

pub use config::{
    AgentConfig, ControllerConfig, ConvoyConfig, HandlerCommandConfig, LockConfig,
    StorageBackend, StorageConfig,
};
pub use error::{ConvoyError, ConvoyResult, ErrorClass};
pub use id::{new_aggregate_id, new_task_id, new_workflow_id, validate_agent_id};

/// Wildcard capability: a task requiring it can run on any agent.
pub const ANY_CAPABILITY: &str = "any";
