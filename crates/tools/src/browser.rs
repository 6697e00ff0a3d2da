//! Rendered-page fetcher using a locally installed headless Chrome/Chromium.
//!
//! The binary is detected once at construction. When none is found the tool
//! stays registered but gracefully declines at execution time, pointing the
//! model at `web_fetch` instead.

use crate::web::extract_html_text;
use async_trait::async_trait;
use mclaw_core::error::ToolError;
use mclaw_core::tool::Tool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

const MAX_TEXT_CHARS: usize = 50_000;

pub struct BrowserTool {
    timeout: Duration,
    chrome: Option<PathBuf>,
}

impl BrowserTool {
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            timeout
        };

        let chrome = detect_chrome();
        match &chrome {
            Some(path) => info!(binary = %path.display(), "Browser tool: Chrome/Chromium detected"),
            None => info!("Browser tool: Chrome/Chromium not found — browser tool disabled"),
        }

        Self { timeout, chrome }
    }

    pub fn is_available(&self) -> bool {
        self.chrome.is_some()
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> String {
        if self.chrome.is_none() {
            "Browser tool (UNAVAILABLE — Chrome/Chromium not installed). Use web_fetch instead."
                .into()
        } else {
            "Open a URL in a headless browser, wait for JavaScript to render, and extract the page text. Use this for JS-heavy sites (SPAs, dynamic content) where web_fetch returns empty/useless content.".into()
        }
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to open in browser" },
                "wait_seconds": {
                    "type": "integer",
                    "description": "Extra seconds to wait for JS rendering (default: 2, max: 10)",
                    "minimum": 0,
                    "maximum": 10
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let Some(chrome) = &self.chrome else {
            return Ok(concat!(
                "Browser tool is unavailable: Chrome/Chromium is not installed on this system. ",
                "For best results with JavaScript-heavy websites (SPAs, dynamic content), install Chrome or Chromium:\n",
                "  - Ubuntu/Debian: sudo apt install chromium-browser\n",
                "  - macOS: brew install --cask chromium\n\n",
                "For now, use the web_fetch tool instead — it works for most websites without a browser.",
            )
            .into());
        };

        let url = args["url"]
            .as_str()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("url is required".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "only http/https URLs are allowed".into(),
            ));
        }

        let wait_seconds = args["wait_seconds"].as_u64().unwrap_or(2).min(10);

        let budget = format!("--virtual-time-budget={}", wait_seconds * 1000);
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(chrome)
                .args([
                    "--headless",
                    "--disable-gpu",
                    "--no-sandbox",
                    "--disable-dev-shm-usage",
                    budget.as_str(),
                    "--dump-dom",
                    url,
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            tool_name: "browser".into(),
            timeout_secs: self.timeout.as_secs(),
        })?
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "browser".into(),
            reason: format!("browser failed: {e}"),
        })?;

        if !output.status.success() {
            return Err(ToolError::ExecutionFailed {
                tool_name: "browser".into(),
                reason: format!(
                    "browser exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let dom = String::from_utf8_lossy(&output.stdout);
        let mut text = extract_html_text(&dom);

        let truncated = text.chars().count() > MAX_TEXT_CHARS;
        if truncated {
            text = text.chars().take(MAX_TEXT_CHARS).collect();
        }

        Ok(format!(
            "URL: {url}\nTruncated: {truncated}\nLength: {}\n\n{text}",
            text.len()
        ))
    }
}

/// Look for a usable Chrome/Chromium binary: absolute candidates directly,
/// bare names via `PATH`.
fn detect_chrome() -> Option<PathBuf> {
    for candidate in CHROME_CANDIDATES {
        let path = Path::new(candidate);
        if path.is_absolute() {
            if path.exists() {
                return Some(path.to_path_buf());
            }
            continue;
        }
        if let Some(found) = search_path(candidate) {
            return Some(found);
        }
    }
    None
}

fn search_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
