//! Prompt context assembly.
//!
//! The system message is built in layers: identity preamble with a workspace
//! hint, an injected context block from workspace markdown files and
//! installed skills, the running summary when non-empty, and the recalled
//! memories rendered as `- [category] content` lines. Raw history follows,
//! then the new user message.

use mclaw_core::message::Message;
use mclaw_memory::SearchResult;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Workspace files folded into the context block, in order.
const CONTEXT_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md"];

/// How many trailing history messages are replayed verbatim.
const HISTORY_WINDOW: usize = 50;

pub struct ContextBuilder {
    workspace: PathBuf,
}

impl ContextBuilder {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Assemble the full message list for one turn.
    pub fn build_messages(
        &self,
        history: &[Message],
        summary: &str,
        user_content: &str,
        memories: &[SearchResult],
    ) -> Vec<Message> {
        let mut system = self.system_preamble();

        if let Some(context_block) = self.context_block() {
            system.push_str("\n\n");
            system.push_str(&context_block);
        }

        if !summary.is_empty() {
            system.push_str("\n\n## Conversation summary\n");
            system.push_str(summary);
        }

        if !memories.is_empty() {
            system.push_str("\n\n## Recalled memories\n");
            for m in memories {
                system.push_str(&format!("- [{}] {}\n", m.item.category, m.item.content));
            }
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system));

        let start = history.len().saturating_sub(HISTORY_WINDOW);
        messages.extend_from_slice(&history[start..]);

        messages.push(Message::user(user_content));
        messages
    }

    fn system_preamble(&self) -> String {
        format!(
            "You are MClaw, a personal AI assistant. You are helpful, concise, and proactive.\nYou have access to tools for files, shell commands, the web, scheduled jobs, and heartbeat notes; use them when they help.\nYour workspace directory is {} — always use absolute paths when working with files.\nCurrent time: {}",
            self.workspace.display(),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z"),
        )
    }

    /// Workspace markdown files plus installed skill descriptions. `None`
    /// when nothing is found.
    fn context_block(&self) -> Option<String> {
        let mut sections: Vec<String> = Vec::new();

        for file in CONTEXT_FILES {
            let path = self.workspace.join(file);
            if let Some(content) = read_nonempty(&path) {
                debug!(file = %path.display(), "Loaded context file");
                sections.push(format!("## {}\n{}", file.trim_end_matches(".md"), content.trim()));
            }
        }

        let skills = self.skills_block();
        if !skills.is_empty() {
            sections.push(format!("## Skills\n{skills}"));
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// One line per installed skill: `workspace/skills/<name>/SKILL.md`.
    fn skills_block(&self) -> String {
        let skills_dir = self.workspace.join("skills");
        let Ok(entries) = std::fs::read_dir(&skills_dir) else {
            return String::new();
        };

        let mut names: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        names.sort();

        let mut lines = Vec::new();
        for dir in names {
            let Some(content) = read_nonempty(&dir.join("SKILL.md")) else {
                continue;
            };
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            // First non-heading line is the skill's one-line description.
            let description = content
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && !l.starts_with('#'))
                .unwrap_or("");
            lines.push(format!("- {name}: {description}"));
        }
        lines.join("\n")
    }
}

fn read_nonempty(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        None
    } else {
        Some(content)
    }
}
