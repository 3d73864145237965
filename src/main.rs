//! Construction research agent
//!
//! An HTTP service that answers building-code and permitting questions by
//! letting a hosted model search a document index and the web, or ask the
//! user a clarifying question.

mod api;
mod db;
mod llm;
mod runtime;
mod state_machine;
mod system_prompt;
mod tools;
mod transcript;

use api::{create_router, AppState};
use db::Database;
use llm::{LlmConfig, ModelRegistry};
use runtime::{
    ConversationStore, DatabaseStore, LlmClient, RegistryLlmClient, RuntimeManager, ToolExecutor,
    ToolRegistryExecutor, DEFAULT_IDLE_TIMEOUT, DEFAULT_TURN_TIMEOUT,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tools::{DuckDuckGoSearch, PineconeConfig, PineconeIndex, ToolRegistry, VectorIndex};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_TOP_K: usize = 4;
const DEFAULT_WEB_RESULTS: usize = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "research_agent=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("AGENT_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.research-agent/agent.db")
    });
    let port: u16 = env_or("AGENT_PORT", 8000);
    let turn_timeout = std::env::var("AGENT_TURN_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(DEFAULT_TURN_TIMEOUT, Duration::from_secs);
    let idle_timeout = std::env::var("AGENT_RUNTIME_IDLE_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(DEFAULT_IDLE_TIMEOUT, Duration::from_secs);
    let top_k = env_or("PINECONE_TOP_K", DEFAULT_TOP_K);
    let web_results = env_or("WEB_SEARCH_MAX_RESULTS", DEFAULT_WEB_RESULTS);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Initialize database
    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // Initialize LLM registry
    let llm_config = LlmConfig::from_env();
    let llm_registry = Arc::new(ModelRegistry::new(&llm_config));

    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM API keys configured. Set GROQ_API_KEY, OPENAI_API_KEY or LLM_GATEWAY.");
    }

    let tool_registry = build_tools(top_k, web_results)?;

    // Runtime
    let store: Arc<dyn ConversationStore> = Arc::new(DatabaseStore::new(db));
    let llm_client: Arc<dyn LlmClient> = Arc::new(RegistryLlmClient::new(
        llm_registry.clone(),
        llm_registry.default_model_id().to_string(),
    ));
    let tool_executor: Arc<dyn ToolExecutor> = Arc::new(ToolRegistryExecutor::new(tool_registry));
    let runtime = Arc::new(
        RuntimeManager::new(store, llm_client, tool_executor, turn_timeout)
            .with_idle_timeout(idle_timeout),
    );

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(runtime.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(turn_timeout_secs = turn_timeout.as_secs(), "Research agent listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            runtime.shutdown();
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Document index (when configured), web search and the ask-user marker
fn build_tools(top_k: usize, web_results: usize) -> Result<ToolRegistry, tools::ToolError> {
    let index: Option<Arc<dyn VectorIndex>> = match PineconeConfig::from_env() {
        Some(config) => {
            tracing::info!(host = %config.index_host, namespace = %config.namespace, "Document index configured");
            Some(Arc::new(PineconeIndex::new(config)?))
        }
        None => {
            tracing::warn!("PINECONE_API_KEY or PINECONE_INDEX_HOST not set; document search will report errors");
            None
        }
    };
    let search = Arc::new(DuckDuckGoSearch::new()?);
    Ok(ToolRegistry::standard(index, search, top_k, web_results))
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Returns when the server should shut down.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT - shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM - shutting down");
        }
    }
}
