use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult, HandlerCommandConfig};
use convoy_orchestrator::{HandlerRegistry, Task, TaskHandler};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Runs an external program per task.
///
/// The payload is written to the program's stdin as JSON. Its stdout is the
/// result: parsed as JSON when possible, kept as a string otherwise. A
/// non-zero exit fails the attempt with the tail of stderr.
pub struct CommandHandler {
    command: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(&self, task: &Task) -> ConvoyResult<serde_json::Value> {
        debug!(task_id = %task.id, command = %self.command, "Spawning handler command");
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .env("CONVOY_TASK_ID", &task.id)
            .env("CONVOY_TASK_TYPE", &task.task_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConvoyError::Handler(format!("Failed to start '{}': {e}", self.command)))?;

        // Feed stdin while draining stdout and stderr; a program that echoes
        // its input would otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let payload = serde_json::to_vec(&task.payload)?;
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                // The program does not care about its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        fed?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConvoyError::Handler(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                tail(stderr.trim(), 2_000)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.to_string())))
    }
}

/// Build the handler set from `[[handlers]]` entries.
pub fn build_handlers(configs: &[HandlerCommandConfig]) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for config in configs {
        info!(task_type = %config.task_type, command = %config.command, "Handler configured");
        handlers.register(
            config.task_type.clone(),
            Arc::new(CommandHandler::new(config.command.clone(), config.args.clone())),
        );
    }
    handlers
}

fn tail(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut start = s.len() - max_len;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_orchestrator::TaskStatus;

    fn task(payload: serde_json::Value) -> Task {
        Task {
            id: "task-1".into(),
            task_type: "scan".into(),
            payload,
            required_capability: "any".into(),
            priority: 5,
            status: TaskStatus::Assigned,
            submitted_at: Utc::now(),
            assigned_agent: Some("a1".into()),
            assigned_at: Some(Utc::now()),
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            finished_at: None,
            workflow_id: None,
        }
    }

    #[tokio::test]
    async fn test_payload_round_trips_through_stdin() {
        let handler = CommandHandler::new("cat", vec![]);
        let payload = serde_json::json!({"target": "10.0.0.1"});
        let result = handler.handle(&task(payload.clone())).await.unwrap();
        assert_eq!(result, payload);
    }

    #[tokio::test]
    async fn test_large_payload_echo_does_not_block() {
        let handler = CommandHandler::new("cat", vec![]);
        let payload = serde_json::json!({"blob": "x".repeat(1 << 20)});
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            handler.handle(&task(payload.clone())),
        )
        .await
        .expect("handler stalled on a 1 MiB payload")
        .unwrap();
        assert_eq!(result, payload);
    }

    #[tokio::test]
    async fn test_program_ignoring_stdin_succeeds() {
        let handler = CommandHandler::new("sh", vec!["-c".into(), "echo '{\"ok\":true}'".into()]);
        let payload = serde_json::json!({"blob": "x".repeat(1 << 20)});
        let result = handler.handle(&task(payload)).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_plain_text_output_is_kept_as_string() {
        let script = "echo open ports: $CONVOY_TASK_TYPE";
        let handler = CommandHandler::new("sh", vec!["-c".into(), script.into()]);
        let result = handler.handle(&task(serde_json::Value::Null)).await.unwrap();
        assert_eq!(result, serde_json::json!("open ports: scan"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let script = "echo unreachable >&2; exit 3";
        let handler = CommandHandler::new("sh", vec!["-c".into(), script.into()]);
        let err = handler.handle(&task(serde_json::Value::Null)).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Handler(ref m) if m.contains("unreachable")));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let handler = CommandHandler::new("/nonexistent/convoy-handler", vec![]);
        assert!(handler.handle(&task(serde_json::Value::Null)).await.is_err());
    }

    #[test]
    fn test_build_handlers() {
        let handlers = build_handlers(&[HandlerCommandConfig {
            task_type: "scan".into(),
            command: "cat".into(),
            args: vec![],
        }]);
        assert_eq!(handlers.task_types(), vec!["scan"]);
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
    }
}
