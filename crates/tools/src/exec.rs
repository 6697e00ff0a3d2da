//! Shell execution tool — `sh -c` scoped to the workspace with a timeout.

use async_trait::async_trait;
use mclaw_core::error::ToolError;
use mclaw_core::tool::Tool;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_BYTES: usize = 30_000;

pub struct ExecTool {
    workspace: PathBuf,
    timeout: Duration,
}

impl ExecTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> String {
        format!(
            "Execute a shell command in the workspace directory ({}) and return stdout/stderr. Commands are killed after {}s.",
            self.workspace.display(),
            self.timeout.as_secs()
        )
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let command = args["command"]
            .as_str()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("command is required".into()))?;

        debug!(command, "Executing shell command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .args(["-c", command])
                .current_dir(&self.workspace)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            tool_name: "exec".into(),
            timeout_secs: self.timeout.as_secs(),
        })?
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "exec".into(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut result = if output.status.success() {
            if stderr.is_empty() {
                stdout.into_owned()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };

        if result.len() > MAX_OUTPUT_BYTES {
            let mut cut = MAX_OUTPUT_BYTES;
            while cut > 0 && !result.is_char_boundary(cut) {
                cut -= 1;
            }
            result.truncate(cut);
            result.push_str("\n... (output truncated)");
        }

        Ok(result.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(dir: &std::path::Path) -> ExecTool {
        ExecTool::new(dir)
    }

    #[tokio::test]
    async fn runs_in_workspace_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "x").unwrap();

        let out = tool(tmp.path())
            .execute(serde_json::json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn captures_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tool(tmp.path())
            .execute(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn failed_command_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tool(tmp.path())
            .execute(serde_json::json!({"command": "exit 3"}))
            .await
            .unwrap();
        assert!(out.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn timeout_kills_long_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(tmp.path()).with_timeout(Duration::from_millis(200));
        let err = tool
            .execute(serde_json::json!({"command": "sleep 5"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_command_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = tool(tmp.path())
            .execute(serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
