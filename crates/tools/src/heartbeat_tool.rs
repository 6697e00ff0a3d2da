//! Heartbeat-notes CRUD surface exposed to the model.

use async_trait::async_trait;
use chrono::{Local, TimeZone, Utc};
use mclaw_core::error::ToolError;
use mclaw_core::tool::Tool;
use mclaw_heartbeat::HeartbeatService;
use std::sync::Arc;

pub struct HeartbeatTool {
    service: Arc<HeartbeatService>,
}

impl HeartbeatTool {
    pub fn new(service: Arc<HeartbeatService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for HeartbeatTool {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn description(&self) -> String {
        r#"Manage heartbeat notes. The bot reviews these periodically and acts on them. Actions:
- "add": Add a new note. Requires: content. Optional: category (reminder, task, note, instruction).
- "list": List all heartbeat notes.
- "remove": Remove a note by ID. Requires: note_id.
- "enable": Enable a note. Requires: note_id.
- "disable": Disable a note. Requires: note_id.
Use this for periodic reminders, tasks, or instructions the bot should check regularly."#
            .into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "Action to perform: add, list, remove, enable, disable",
                    "enum": ["add", "list", "remove", "enable", "disable"]
                },
                "content": { "type": "string", "description": "Content of the note (required for add)" },
                "category": {
                    "type": "string",
                    "description": "Category: reminder, task, note, instruction (default: note)",
                    "enum": ["reminder", "task", "note", "instruction"]
                },
                "note_id": { "type": "string", "description": "Note ID (required for remove/enable/disable)" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        match args["action"].as_str().unwrap_or("") {
            "add" => Ok(self.add_note(&args)),
            "list" => Ok(self.list_notes()),
            "remove" => Ok(self.remove_note(&args)),
            "enable" => Ok(self.toggle_note(&args, true)),
            "disable" => Ok(self.toggle_note(&args, false)),
            other => Ok(format!(
                "Unknown action: {other}. Use: add, list, remove, enable, disable"
            )),
        }
    }
}

impl HeartbeatTool {
    fn add_note(&self, args: &serde_json::Value) -> String {
        let content = args["content"].as_str().unwrap_or("");
        if content.is_empty() {
            return "Error: 'content' is required for add".into();
        }
        let category = args["category"].as_str().unwrap_or("");

        match self.service.add_note(content, category) {
            Ok(note) => format!(
                "Added heartbeat note (ID: {})\n  Category: {}\n  Content: {}",
                note.id, note.category, note.content
            ),
            Err(e) => format!("Error adding note: {e}"),
        }
    }

    fn list_notes(&self) -> String {
        let notes = self.service.list_notes(true);
        if notes.is_empty() {
            return "No heartbeat notes.".into();
        }

        let rendered: Vec<serde_json::Value> = notes
            .iter()
            .map(|n| {
                let created = match Utc.timestamp_millis_opt(n.created_at_ms) {
                    chrono::LocalResult::Single(dt) => dt
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M")
                        .to_string(),
                    _ => String::new(),
                };
                serde_json::json!({
                    "id": n.id,
                    "content": n.content,
                    "category": n.category,
                    "enabled": n.enabled,
                    "created_at": created,
                })
            })
            .collect();

        format!(
            "Heartbeat notes ({}):\n{}",
            rendered.len(),
            serde_json::to_string_pretty(&rendered).unwrap_or_default()
        )
    }

    fn remove_note(&self, args: &serde_json::Value) -> String {
        let note_id = args["note_id"].as_str().unwrap_or("");
        if note_id.is_empty() {
            return "Error: 'note_id' is required for remove".into();
        }
        if self.service.remove_note(note_id) {
            format!("Removed note {note_id}")
        } else {
            format!("Note {note_id} not found")
        }
    }

    fn toggle_note(&self, args: &serde_json::Value, enable: bool) -> String {
        let note_id = args["note_id"].as_str().unwrap_or("");
        if note_id.is_empty() {
            return "Error: 'note_id' is required".into();
        }
        match self.service.enable_note(note_id, enable) {
            Some(note) => {
                let preview: String = note.content.chars().take(50).collect();
                format!(
                    "Note '{preview}' {}",
                    if enable { "enabled" } else { "disabled" }
                )
            }
            None => format!("Note {note_id} not found"),
        }
    }
}
