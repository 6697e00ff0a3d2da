//! Web tools: search (Brave API) and URL fetching with HTML normalization.

use async_trait::async_trait;
use mclaw_core::error::ToolError;
use mclaw_core::tool::Tool;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

// ── WebSearchTool ───────────────────────────────────────────

pub struct WebSearchTool {
    api_key: String,
    max_results: u32,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: impl Into<String>, max_results: u32) -> Self {
        let max_results = if max_results == 0 || max_results > 10 {
            5
        } else {
            max_results
        };
        Self {
            api_key: api_key.into(),
            max_results,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

fn format_search_results(query: &str, results: &[BraveResult], count: usize) -> String {
    if results.is_empty() {
        return format!("No results for: {query}");
    }

    let mut lines = vec![format!("Results for: {query}")];
    for (i, item) in results.iter().take(count).enumerate() {
        lines.push(format!("{}. {}\n   {}", i + 1, item.title, item.url));
        if !item.description.is_empty() {
            lines.push(format!("   {}", item.description));
        }
    }
    lines.join("\n")
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> String {
        "Search the web. Returns titles, URLs, and snippets.".into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "count": {
                    "type": "integer",
                    "description": "Number of results (1-10)",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        if self.api_key.is_empty() {
            // Reported to the model as a result, not an error, so it can
            // choose another tool.
            return Ok("Error: web search API key not configured".into());
        }

        let query = args["query"]
            .as_str()
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;

        let count = args["count"]
            .as_u64()
            .filter(|c| (1..=10).contains(c))
            .unwrap_or(self.max_results as u64) as usize;

        let count_param = count.to_string();
        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", count_param.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "web_search".into(),
                reason: format!("request failed: {e}"),
            })?;

        let parsed: BraveResponse =
            response.json().await.map_err(|e| ToolError::ExecutionFailed {
                tool_name: "web_search".into(),
                reason: format!("failed to parse response: {e}"),
            })?;

        Ok(format_search_results(query, &parsed.web.results, count))
    }
}

// ── WebFetchTool ────────────────────────────────────────────

const DEFAULT_MAX_CHARS: usize = 50_000;

pub struct WebFetchTool {
    max_chars: usize,
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: if max_chars == 0 { DEFAULT_MAX_CHARS } else { max_chars },
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .redirect(reqwest::redirect::Policy::limited(5))
                .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36")
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> String {
        "Fetch a URL and extract readable content (HTML to text). Use this to get weather info, news, articles, or any web content.".into()
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to fetch" },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to extract",
                    "minimum": 100
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let url = args["url"]
            .as_str()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("url is required".into()))?;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "only http/https URLs are allowed".into(),
            ));
        }

        let max_chars = args["max_chars"]
            .as_u64()
            .filter(|mc| *mc > 100)
            .map(|mc| mc as usize)
            .unwrap_or(self.max_chars);

        let response = self
            .client
            .get(url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "web_fetch".into(),
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "web_fetch".into(),
            reason: format!("failed to read response: {e}"),
        })?;

        let (mut text, extractor) = normalize_body(&content_type, &body);

        let truncated = text.chars().count() > max_chars;
        if truncated {
            text = text.chars().take(max_chars).collect();
        }

        debug!(url, status, extractor, truncated, "Fetched URL");

        let envelope = serde_json::json!({
            "url": url,
            "status": status,
            "extractor": extractor,
            "truncated": truncated,
            "length": text.len(),
            "text": text,
        });
        Ok(serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| text))
    }
}

/// Pick an extraction strategy from the Content-Type (or body sniffing) and
/// return (text, extractor tag).
fn normalize_body(content_type: &str, body: &str) -> (String, &'static str) {
    if content_type.contains("application/json") {
        return match serde_json::from_str::<serde_json::Value>(body) {
            Ok(v) => (
                serde_json::to_string_pretty(&v).unwrap_or_else(|_| body.to_string()),
                "json",
            ),
            Err(_) => (body.to_string(), "raw"),
        };
    }

    let looks_like_html = content_type.contains("text/html")
        || body.trim_start().starts_with("<!DOCTYPE")
        || body.trim_start().to_lowercase().starts_with("<html");
    if looks_like_html {
        return (extract_html_text(body), "html");
    }

    (body.to_string(), "raw")
}

const SKIP_ANCESTORS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "iframe", "noscript", "svg", "form", "button",
    "select", "textarea",
];

/// Extract readable text from HTML, preserving document structure:
/// headings as `#` prefixes, paragraphs, `•` list items, `[text](href)`
/// links, fenced code blocks, and blockquotes.
pub(crate) fn extract_html_text(html: &str) -> String {
    let document = Html::parse_document(html);

    // Prefer an identified main-content region over the whole body.
    let main_selector =
        Selector::parse("main, article, [role='main'], #content, #main").expect("static selector");
    let body_selector = Selector::parse("body").expect("static selector");
    let any = Selector::parse("*").expect("static selector");

    let root: Option<ElementRef> = document
        .select(&main_selector)
        .next()
        .or_else(|| document.select(&body_selector).next());

    let mut parts: Vec<String> = Vec::new();

    let elements: Vec<ElementRef> = match root {
        Some(r) => r.select(&any).collect(),
        None => document.select(&any).collect(),
    };

    for element in elements {
        if has_skipped_ancestor(element) {
            continue;
        }
        let tag = element.value().name();
        match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let text = own_text(element);
                if !text.is_empty() {
                    let level = tag.as_bytes()[1] - b'0';
                    parts.push(format!("\n{} {}\n", "#".repeat(level as usize), text));
                }
            }
            "p" => {
                let text = own_text(element);
                if !text.is_empty() {
                    parts.push(format!("{text}\n"));
                }
            }
            "li" => {
                let text = own_text(element);
                if !text.is_empty() {
                    parts.push(format!("• {text}"));
                }
            }
            "a" => {
                let text = own_text(element);
                if let Some(href) = element.value().attr("href") {
                    if !text.is_empty() && href.starts_with("http") {
                        parts.push(format!("[{text}]({href})"));
                    }
                }
            }
            "blockquote" => {
                let text = own_text(element);
                if !text.is_empty() {
                    parts.push(format!("> {text}\n"));
                }
            }
            "pre" | "code" => {
                let text = own_text(element);
                if !text.is_empty() {
                    parts.push(format!("```\n{text}\n```\n"));
                }
            }
            "br" => parts.push("\n".into()),
            _ => {}
        }
    }

    if parts.is_empty() {
        if let Some(r) = root {
            let text = own_text(r);
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }

    let joined = parts.join("\n");
    collapse_blank_lines(&joined)
}

fn has_skipped_ancestor(element: ElementRef) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|el| SKIP_ANCESTORS.contains(&el.name()))
    })
}

fn own_text(element: ElementRef) -> String {
    let text: String = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim().to_string()
}

fn collapse_blank_lines(s: &str) -> String {
    let re = regex::Regex::new(r"\n{3,}").expect("static regex");
    re.replace_all(s, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_without_key_declines_gracefully() {
        let tool = WebSearchTool::new("", 5);
        let out = tool
            .execute(serde_json::json!({"query": "rust async"}))
            .await
            .unwrap();
        assert!(out.contains("not configured"));
    }

    #[tokio::test]
    async fn search_requires_query() {
        let tool = WebSearchTool::new("key", 5);
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn search_result_formatting() {
        let results = vec![
            BraveResult {
                title: "The Rust Book".into(),
                url: "https://doc.rust-lang.org/book/".into(),
                description: "Learn Rust".into(),
            },
            BraveResult {
                title: "crates.io".into(),
                url: "https://crates.io".into(),
                description: String::new(),
            },
        ];
        let out = format_search_results("rust", &results, 2);
        assert!(out.starts_with("Results for: rust"));
        assert!(out.contains("1. The Rust Book"));
        assert!(out.contains("Learn Rust"));
        assert!(out.contains("2. crates.io"));
    }

    #[test]
    fn search_empty_results_message() {
        assert_eq!(
            format_search_results("xyzzy", &[], 5),
            "No results for: xyzzy"
        );
    }

    #[test]
    fn search_max_results_clamped() {
        assert_eq!(WebSearchTool::new("k", 0).max_results, 5);
        assert_eq!(WebSearchTool::new("k", 50).max_results, 5);
        assert_eq!(WebSearchTool::new("k", 3).max_results, 3);
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_schemes() {
        let tool = WebFetchTool::new(0);
        let err = tool
            .execute(serde_json::json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn html_extraction_preserves_structure() {
        let html = r#"
            <html><head><style>body { color: red }</style></head><body>
            <nav><a href="https://nav.example">skip me</a></nav>
            <main>
                <h1>Main Title</h1>
                <h3>Subsection</h3>
                <p>First paragraph with content.</p>
                <ul><li>alpha</li><li>beta</li></ul>
                <a href="https://example.com/docs">the docs</a>
                <blockquote>a quoted line</blockquote>
                <pre>let x = 1;</pre>
            </main>
            </body></html>
        "#;
        let text = extract_html_text(html);
        assert!(text.contains("# Main Title"));
        assert!(text.contains("### Subsection"));
        assert!(text.contains("First paragraph with content."));
        assert!(text.contains("• alpha"));
        assert!(text.contains("• beta"));
        assert!(text.contains("[the docs](https://example.com/docs)"));
        assert!(text.contains("> a quoted line"));
        assert!(text.contains("```\nlet x = 1;\n```"));
        assert!(!text.contains("skip me"));
        assert!(!text.contains("color: red"));
    }

    #[test]
    fn html_extraction_skips_relative_links() {
        let html = r#"<body><p>text</p><a href="/relative">rel</a></body>"#;
        let text = extract_html_text(html);
        assert!(!text.contains("rel"));
        assert!(text.contains("text"));
    }

    #[test]
    fn normalize_json_pretty_printed() {
        let (text, extractor) = normalize_body("application/json", r#"{"a":1,"b":[2,3]}"#);
        assert_eq!(extractor, "json");
        assert!(text.contains("\"a\": 1"));
        assert!(text.lines().count() > 1);
    }

    #[test]
    fn normalize_invalid_json_is_raw() {
        let (text, extractor) = normalize_body("application/json", "{broken");
        assert_eq!(extractor, "raw");
        assert_eq!(text, "{broken");
    }

    #[test]
    fn normalize_sniffs_html_without_content_type() {
        let (_, extractor) = normalize_body("", "<!DOCTYPE html><html><body><p>x</p></body></html>");
        assert_eq!(extractor, "html");
    }

    #[test]
    fn normalize_plain_text_is_raw() {
        let (text, extractor) = normalize_body("text/plain", "just text");
        assert_eq!(extractor, "raw");
        assert_eq!(text, "just text");
    }

    #[test]
    fn blank_lines_collapsed() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
    }
}
