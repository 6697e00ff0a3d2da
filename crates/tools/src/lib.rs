//! Built-in tools for the MClaw agent.
//!
//! Every tool implements [`mclaw_core::Tool`] and is registered in the
//! [`mclaw_core::ToolRegistry`] by the agent loop. Tool failures surface as
//! tool results, never as iteration errors, so the model can recover.

mod browser;
mod cron_tool;
mod exec;
mod files;
mod heartbeat_tool;
mod web;

pub use browser::BrowserTool;
pub use cron_tool::{CronTool, DeliveryContext};
pub use exec::ExecTool;
pub use files::{ListDirTool, ReadFileTool, WriteFileTool};
pub use heartbeat_tool::HeartbeatTool;
pub use web::{WebFetchTool, WebSearchTool};
