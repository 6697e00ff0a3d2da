//! File tools: read, write, list.

use async_trait::async_trait;
use mclaw_core::error::ToolError;
use mclaw_core::tool::Tool;

const MAX_READ_BYTES: usize = 50_000;

fn string_arg(args: &serde_json::Value, name: &str) -> Result<String, ToolError> {
    match args[name].as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(ToolError::InvalidArguments(format!("{name} is required"))),
    }
}

// ── ReadFileTool ────────────────────────────────────────────

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> String {
        "Read the contents of a file at the given path. Returns the file content as text.".into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file to read" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = string_arg(&args, "path")?;

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "read_file".into(),
                reason: format!("failed to read file: {e}"),
            })?;

        let mut content = String::from_utf8_lossy(&data).into_owned();
        if content.len() > MAX_READ_BYTES {
            let total = content.len();
            content.truncate(floor_char_boundary(&content, MAX_READ_BYTES));
            content.push_str(&format!(
                "\n... (truncated, {} more bytes)",
                total - MAX_READ_BYTES
            ));
        }

        Ok(content)
    }
}

// ── WriteFileTool ───────────────────────────────────────────

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> String {
        "Write content to a file at the given path. Creates the file and parent directories if they don't exist. Overwrites existing content.".into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file to write" },
                "content": { "type": "string", "description": "Content to write to the file" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = string_arg(&args, "path")?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("content is required".into()))?;

        if let Some(dir) = std::path::Path::new(&path).parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "write_file".into(),
                    reason: format!("failed to create directories: {e}"),
                })?;
        }

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "write_file".into(),
                reason: format!("failed to write file: {e}"),
            })?;

        Ok(format!("Successfully wrote {} bytes to {}", content.len(), path))
    }
}

// ── ListDirTool ─────────────────────────────────────────────

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> String {
        "List the contents of a directory. Returns file names, sizes, and types.".into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the directory to list" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = string_arg(&args, "path")?;

        let abs = std::path::Path::new(&path)
            .canonicalize()
            .unwrap_or_else(|_| std::path::PathBuf::from(&path));

        let mut entries = tokio::fs::read_dir(&abs)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "list_dir".into(),
                reason: format!("failed to read directory: {e}"),
            })?;

        let mut lines = vec![format!("Directory: {}\n", abs.display())];
        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            count += 1;
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(meta) if meta.is_dir() => lines.push(format!("[dir]  {name}/")),
                Ok(meta) => lines.push(format!("[file] {name} ({})", format_size(meta.len()))),
                Err(_) => lines.push(format!("[file] {name}")),
            }
        }

        if count == 0 {
            lines.push("(empty directory)".into());
        }

        Ok(lines.join("\n"))
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1 << 20 {
        format!("{:.1} MB", bytes as f64 / (1 << 20) as f64)
    } else if bytes >= 1 << 10 {
        format!("{:.1} KB", bytes as f64 / (1 << 10) as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Largest index ≤ `max` that falls on a char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
