//! Web search via the DuckDuckGo HTML endpoint (no API key needed)

use super::{Tool, ToolContext, ToolError, ToolOutput};
use crate::state_machine::state::{WebSearchInput, WEB_SEARCH_TOOL};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const DDG_HTML_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; research-agent/0.1)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"]*)""#).expect("valid regex"));

/// One web search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub excerpt: String,
}

/// A web search backend
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Return up to `max_results` hits in ranking order
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError>;
}

pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    pub fn new() -> Result<Self, ToolError> {
        Self::with_endpoint(DDG_HTML_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, ToolError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError> {
        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query));
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        let html = response.text().await?;
        if !status.is_success() {
            return Err(ToolError::Provider {
                status: status.as_u16(),
                body: html.chars().take(200).collect(),
            });
        }

        Ok(extract_ddg_results(&html, max_results))
    }
}

/// Extract search results from DuckDuckGo HTML.
fn extract_ddg_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    html.split("result__body")
        .skip(1)
        .filter_map(parse_result_chunk)
        .take(max_results)
        .collect()
}

fn parse_result_chunk(chunk: &str) -> Option<SearchHit> {
    let anchor = chunk.split("class=\"result__a\"").nth(1)?;
    let title = clean_text(inner_html(anchor, "</a>"));
    if title.is_empty() {
        return None;
    }

    let tag_tail = anchor.split('>').next().unwrap_or_default();
    let href = HREF_RE.captures(tag_tail).map(|c| c[1].to_string());

    let url = href
        .map(|h| resolve_redirect(&html_decode(&h)))
        .filter(|u| !u.is_empty())
        .or_else(|| {
            chunk
                .split("class=\"result__url\"")
                .nth(1)
                .map(|s| clean_text(inner_html(s, "</a>")))
        })
        .unwrap_or_default();

    let excerpt = chunk
        .split("class=\"result__snippet\"")
        .nth(1)
        .map(|s| clean_text(inner_html(s, "</a>")))
        .unwrap_or_default();

    Some(SearchHit {
        title,
        url,
        excerpt,
    })
}

/// Text between the end of the current opening tag and `close`
fn inner_html<'a>(after_attr: &'a str, close: &str) -> &'a str {
    let body = after_attr.split_once('>').map_or("", |(_, rest)| rest);
    body.split(close).next().unwrap_or(body)
}

fn clean_text(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, "");
    html_decode(stripped.trim())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unwrap DuckDuckGo's `/l/?uddg=<target>` redirect links
fn resolve_redirect(href: &str) -> String {
    if let Some((_, rest)) = href.split_once("uddg=") {
        let encoded = rest.split('&').next().unwrap_or(rest);
        if let Ok(decoded) = urlencoding::decode(encoded) {
            return decoded.into_owned();
        }
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    href.to_string()
}

/// Basic HTML entity decoding.
fn html_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

fn render_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results found for: {query}");
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        let _ = write!(out, "{}. {}\nURL: {}\n{}", i + 1, hit.title, hit.url, hit.excerpt);
    }
    out
}

// ============================================================================
// Tool
// ============================================================================

pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        Self {
            provider,
            max_results,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        WEB_SEARCH_TOOL
    }

    fn description(&self) -> String {
        "Search the internet. Use when the document index does not cover the question or the answer may have changed recently. Returns titles, URLs and excerpts.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["search_query"],
            "properties": {
                "search_query": {
                    "type": "string",
                    "description": "Exact search terms"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: WebSearchInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let search = self.provider.search(&input.search_query, self.max_results);
        match ctx.cancellable(search).await {
            Ok(hits) => ToolOutput::success(render_hits(&input.search_query, &hits)),
            Err(e) => {
                tracing::warn!(conv_id = %ctx.conversation_id, error = %e, "Web search failed");
                e.into()
            }
        }
    }
}
