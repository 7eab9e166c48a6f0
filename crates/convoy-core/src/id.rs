use crate::error::{ConvoyError, ConvoyResult};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

fn agent_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("agent id pattern is valid")
    })
}

/// Check an agent id against the identifier grammar
/// (1–64 ASCII alphanumerics, `_` or `-`).
pub fn validate_agent_id(id: &str) -> ConvoyResult<()> {
    if agent_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(ConvoyError::InvalidAgentId(id.to_string()))
    }
}

/// Generate a new task id. Ids sort in generation order.
pub fn new_task_id() -> String {
    prefixed("task")
}

/// Generate a new workflow id.
pub fn new_workflow_id() -> String {
    prefixed("wf")
}

/// Generate a new aggregate id.
pub fn new_aggregate_id() -> String {
    prefixed("agg")
}

fn prefixed(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7().simple())
}
