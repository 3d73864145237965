//! Document retrieval over a vector index
//!
//! The index embeds the query itself (integrated inference), so no
//! embedding is computed here.

use super::{Tool, ToolContext, ToolError, ToolOutput};
use crate::state_machine::state::{RetrieveInput, RETRIEVE_TOOL};
use crate::state_machine::SourceMetadata;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

const PINECONE_API_VERSION: &str = "2025-04";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One document returned by the index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    pub score: f64,
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl IndexMatch {
    /// Provenance extracted from the stored metadata
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // page numbers stored as floats
    pub fn source_metadata(&self) -> SourceMetadata {
        let str_field = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| self.metadata.get(*k).and_then(Value::as_str))
                .map(String::from)
        };

        let page = self.metadata.get("page").and_then(|v| match v {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });

        SourceMetadata {
            document_id: self.id.clone(),
            source: str_field(&["source", "url", "filename"]),
            page,
            location: str_field(&["location", "section", "title"]),
            metadata: self.metadata.clone(),
        }
    }
}

/// A searchable document index
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` documents for the query, best first
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<IndexMatch>, ToolError>;
}

// ============================================================================
// Pinecone
// ============================================================================

/// Connection settings for a Pinecone index with integrated embedding
#[derive(Debug, Clone)]
pub struct PineconeConfig {
    pub api_key: String,
    /// Data-plane host of the index, e.g. `my-index-abc123.svc.us-east1.pinecone.io`
    pub index_host: String,
    pub namespace: String,
    /// Record field holding the document text
    pub text_field: String,
}

impl PineconeConfig {
    /// Read from `PINECONE_*` variables; `None` when key or host is missing
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("PINECONE_API_KEY").ok()?;
        let index_host = std::env::var("PINECONE_INDEX_HOST").ok()?;
        if api_key.is_empty() || index_host.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            index_host,
            namespace: std::env::var("PINECONE_NAMESPACE")
                .unwrap_or_else(|_| "__default__".to_string()),
            text_field: std::env::var("PINECONE_TEXT_FIELD").unwrap_or_else(|_| "text".to_string()),
        })
    }

    fn search_url(&self) -> String {
        let host = self.index_host.trim_end_matches('/');
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        format!(
            "{base}/records/namespaces/{}/search",
            urlencoding::encode(&self.namespace)
        )
    }
}

pub struct PineconeIndex {
    client: Client,
    config: PineconeConfig,
}

impl PineconeIndex {
    pub fn new(config: PineconeConfig) -> Result<Self, ToolError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: f64,
    #[serde(default)]
    fields: Map<String, Value>,
}

fn hit_to_match(mut hit: Hit, text_field: &str) -> IndexMatch {
    let content = match hit.fields.remove(text_field) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    IndexMatch {
        id: hit.id,
        score: hit.score,
        content,
        metadata: hit.fields,
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<IndexMatch>, ToolError> {
        let body = json!({
            "query": {
                "inputs": { "text": query },
                "top_k": top_k,
            }
        });

        let response = self
            .client
            .post(self.config.search_url())
            .header("Api-Key", &self.config.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed
            .result
            .hits
            .into_iter()
            .map(|h| hit_to_match(h, &self.config.text_field))
            .collect())
    }
}

// ============================================================================
// Tool
// ============================================================================

/// Searches the document index and reports the matched documents' sources
pub struct RetrieveTool {
    index: Option<Arc<dyn VectorIndex>>,
    top_k: usize,
}

impl RetrieveTool {
    pub fn new(index: Option<Arc<dyn VectorIndex>>, top_k: usize) -> Self {
        Self { index, top_k }
    }

    async fn retrieve(&self, query: &str, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let index = self
            .index
            .as_ref()
            .ok_or(ToolError::NotConfigured("Document index"))?;

        let matches = ctx.cancellable(index.search(query, self.top_k)).await?;
        if matches.is_empty() {
            return Err(ToolError::EmptyIndex);
        }

        let sources = matches.iter().map(IndexMatch::source_metadata).collect();
        Ok(ToolOutput::success(render_matches(&matches)).with_sources(sources))
    }
}

/// Documents in index order, each headed by its citation fields
fn render_matches(matches: &[IndexMatch]) -> String {
    let mut out = String::new();
    for (i, m) in matches.iter().enumerate() {
        let src = m.source_metadata();
        if i > 0 {
            out.push_str("\n\n");
        }
        let _ = write!(out, "[{}] Document ID: {}", i + 1, m.id);
        if let Some(source) = &src.source {
            let _ = write!(out, " | Source: {source}");
        }
        if let Some(page) = src.page {
            let _ = write!(out, " | Page: {page}");
        }
        if let Some(location) = &src.location {
            let _ = write!(out, " | Location: {location}");
        }
        out.push('\n');
        out.push_str(m.content.trim());
    }
    out
}

#[async_trait]
impl Tool for RetrieveTool {
    fn name(&self) -> &'static str {
        RETRIEVE_TOOL
    }

    fn description(&self) -> String {
        "Search the Fairfax County construction documents (county web pages and PDFs) for passages relevant to the query. Returns the matching documents with their IDs, sources and pages for citation.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["search_query"],
            "properties": {
                "search_query": {
                    "type": "string",
                    "description": "Query to search for in the document index"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: RetrieveInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        match self.retrieve(&input.search_query, &ctx).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(conv_id = %ctx.conversation_id, error = %e, "Retrieval failed");
                e.into()
            }
        }
    }
}
