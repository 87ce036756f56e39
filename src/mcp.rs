use std::{path::PathBuf, sync::Arc};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    engine::Engine,
    error::{self, Error},
    search::RetrievedChunk,
    status::BuildStatus,
};

const DEFAULT_SEARCH_LIMIT: usize = 5;
const SUMMARY_PREVIEW_CHARS: usize = 120;

#[derive(Clone)]
pub struct MemdexMcpServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

impl MemdexMcpServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl MemdexMcpServer {
    /// Retrieve the chunks most similar to a query.
    #[tool(
        name = "memdex_search",
        description = "Search the indexed chat memory. Returns the most similar chunks, optionally restricted to a category."
    )]
    pub async fn memdex_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let query = params.query;
        let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let category = params.category;

        let engine = Arc::clone(&self.engine);
        let q = query.clone();
        let results = tokio::task::spawn_blocking(move || {
            engine.retrieve(&q, limit, category.as_deref())
        })
        .await
        .map_err(|e| mcp_error("search task failed", e))?
        .map_err(|e| mcp_error("search failed", e))?;

        let summary = format_search_summary(&results, &query);
        let structured = serde_json::to_value(SearchResponse {
            result_count: results.len(),
            query,
            results,
        })
        .map_err(|e| mcp_error("failed to serialize search results", e))?;

        Ok({
            let mut result = CallToolResult::success(vec![Content::text(summary)]);
            result.structured_content = Some(structured);
            result
        })
    }

    /// Report build progress and index readiness.
    #[tool(
        name = "memdex_status",
        description = "Report the index build status: phase, percentage, batch and chunk counts, and whether searches can be answered."
    )]
    pub async fn memdex_status(
        &self,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let status = self.engine.build_status();
        let structured = serde_json::to_value(&status)
            .map_err(|e| mcp_error("failed to serialize status", e))?;

        Ok({
            let mut result = CallToolResult::success(vec![Content::text(format_status_summary(&status))]);
            result.structured_content = Some(structured);
            result
        })
    }

    /// Start a background build.
    #[tool(
        name = "memdex_build",
        description = "Start building or resuming the index for a JSON-lines corpus in the background. Poll memdex_status for progress."
    )]
    pub async fn memdex_build(
        &self,
        params: Parameters<BuildParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let corpus = PathBuf::from(&params.corpus);

        match self.engine.spawn_build(corpus, params.max_batches) {
            Ok(_handle) => {
                info!(corpus = %params.corpus, "Build started from MCP");
                Ok({
                    let mut result = CallToolResult::success(vec![Content::text(format!(
                        "Started building the index for {}",
                        params.corpus
                    ))]);
                    result.structured_content = Some(json!({
                        "started": true,
                        "corpus": params.corpus,
                    }));
                    result
                })
            }
            Err(e @ Error::BuildInProgress) => Ok({
                let mut result = CallToolResult::error(vec![Content::text(e.to_string())]);
                result.structured_content = Some(json!({
                    "started": false,
                    "error": e.to_string(),
                }));
                result
            }),
            Err(e) => Err(mcp_error("failed to start build", e)),
        }
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for MemdexMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("memdex", env!("CARGO_PKG_VERSION")).with_title("memdex MCP"),
            )
            .with_instructions(
                "Use memdex_search to recall past conversations and notes. Check memdex_status before searching if results come back empty.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Search query string.
    pub query: String,
    /// Maximum number of results (default: 5).
    pub limit: Option<usize>,
    /// Only return chunks whose category contains this text.
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildParams {
    /// Path to the JSON-lines corpus, plain or gzipped.
    pub corpus: String,
    /// Stop after this many batches.
    pub max_batches: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    result_count: usize,
    results: Vec<RetrievedChunk>,
}

fn format_search_summary(results: &[RetrievedChunk], query: &str) -> String {
    if results.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} result{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for r in results {
        let label = if r.title.is_empty() { &r.source } else { &r.title };
        lines.push(format!(
            "{}. {:.3} {} | {}",
            r.rank,
            r.score,
            label,
            preview(&r.text)
        ));
    }

    lines.join("\n")
}

fn format_status_summary(status: &BuildStatus) -> String {
    let mut summary = format!(
        "{} ({}%): {}",
        status.status, status.percentage, status.progress
    );
    if let Some(error) = &status.error {
        summary.push_str(&format!("\nerror: {error}"));
    }
    summary
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(SUMMARY_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

/// Serve the engine over stdio until the client disconnects.
///
/// The engine is dropped by the caller after the runtime shuts down, so
/// its blocking HTTP client never drops inside async code.
pub fn run_mcp(engine: Arc<Engine>) -> error::Result<()> {
    let server = MemdexMcpServer::new(Arc::clone(&engine));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    let served = runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            Error::Config(format!("MCP server initialization failed: {e}"))
        })?;
        running
            .waiting()
            .await
            .map_err(|e| Error::Config(format!("MCP server error: {e}")))?;
        Ok(())
    });
    drop(runtime);
    drop(engine);
    served
}
