// Agent tools
// A closed set of knowledge-base tools the model may call, validated when the registry is built


use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

use super::AgentContext;
use super::llm::ToolDefinition;
use crate::retrieval::{RetrievalEngine, format_context};
use crate::{KbError, Result};

/// Longest document excerpt handed back to the model
const MAX_DOCUMENT_CHARS: usize = 4000;
const MAX_KEYWORD_MATCHES: usize = 10;
const SNIPPET_RADIUS: usize = 80;
const MAX_SEARCH_LIMIT: u64 = 20;

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the arguments object
    fn parameters(&self) -> Value;

    async fn invoke(&self, ctx: &AgentContext, args: Value) -> Result<String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    /// Build a registry, rejecting blank or duplicate names and non-object schemas
    #[inline]
    pub fn new(tools: Vec<Arc<dyn AgentTool>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for tool in &tools {
            let name = tool.name();
            if name.trim().is_empty() {
                return Err(KbError::Config("Tool name cannot be empty".to_string()));
            }
            if !seen.insert(name) {
                return Err(KbError::Config(format!("Duplicate tool name '{}'", name)));
            }
            if tool.parameters()["type"] != "object" {
                return Err(KbError::Config(format!(
                    "Tool '{}' parameters must be an object schema",
                    name
                )));
            }
        }
        info!("Registered {} agent tools", tools.len());
        Ok(Self { tools })
    }

    /// The five knowledge-base tools
    #[inline]
    pub fn with_defaults(retrieval: Arc<RetrievalEngine>) -> Result<Self> {
        let tools: Vec<Arc<dyn AgentTool>> = vec![
            Arc::new(SearchKnowledgeBaseTool::new(Arc::clone(&retrieval))),
            Arc::new(ListDocumentsTool::new(Arc::clone(&retrieval))),
            Arc::new(SearchDocumentsTool::new(Arc::clone(&retrieval))),
            Arc::new(SummarizeDocumentTool::new(Arc::clone(&retrieval))),
            Arc::new(GetWorkspaceInfoTool::new(retrieval)),
        ];
        Self::new(tools)
    }

    #[inline]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    #[inline]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentTool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    /// Parse and check the model's arguments, then run the named tool
    #[inline]
    pub async fn invoke(&self, ctx: &AgentContext, name: &str, raw_args: &str) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| KbError::AgentExecution(format!("Unknown tool '{}'", name)))?;

        let args: Value = if raw_args.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(raw_args).map_err(|e| {
                KbError::Validation(format!("Invalid arguments for tool '{}': {}", name, e))
            })?
        };
        if !args.is_object() {
            return Err(KbError::Validation(format!(
                "Arguments for tool '{}' must be a JSON object",
                name
            )));
        }
        validate_required(&tool.parameters(), &args)
            .map_err(|e| KbError::Validation(format!("Tool '{}': {}", name, e)))?;

        debug!("Invoking tool {} with {}", name, args);
        tool.invoke(ctx, args).await
    }
}

fn validate_required(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(Value::as_str) {
            if args.get(key).is_none_or(Value::is_null) {
                return Err(format!("Missing required argument: {}", key));
            }
        }
    }
    Ok(())
}

fn string_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args[key]
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| KbError::Validation(format!("Argument '{}' must be a non-empty string", key)))
}

/// Semantic search over the workspace knowledge base
pub struct SearchKnowledgeBaseTool {
    retrieval: Arc<RetrievalEngine>,
}

impl SearchKnowledgeBaseTool {
    #[inline]
    pub fn new(retrieval: Arc<RetrievalEngine>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl AgentTool for SearchKnowledgeBaseTool {
    #[inline]
    fn name(&self) -> &'static str {
        "search_knowledge_base"
    }

    #[inline]
    fn description(&self) -> &'static str {
        "Find passages in the workspace knowledge base that are semantically related to a question"
    }

    #[inline]
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "limit": { "type": "integer", "description": "Maximum passages to return" }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &AgentContext, args: Value) -> Result<String> {
        let query = string_arg(&args, "query")?;
        let defaults = self.retrieval.defaults();
        let limit = args["limit"]
            .as_u64()
            .map_or(defaults.top_k, |l| l.clamp(1, MAX_SEARCH_LIMIT) as usize);

        let items = self
            .retrieval
            .query(query, &ctx.knowledge_base_id, limit, defaults.score_threshold)
            .await?;
        Ok(format_context(&items))
    }
}

/// Titles and ids of every document in the knowledge base
pub struct ListDocumentsTool {
    retrieval: Arc<RetrievalEngine>,
}

impl ListDocumentsTool {
    #[inline]
    pub fn new(retrieval: Arc<RetrievalEngine>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl AgentTool for ListDocumentsTool {
    #[inline]
    fn name(&self) -> &'static str {
        "list_documents"
    }

    #[inline]
    fn description(&self) -> &'static str {
        "List the documents stored in the workspace knowledge base"
    }

    #[inline]
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn invoke(&self, ctx: &AgentContext, _args: Value) -> Result<String> {
        let documents = self
            .retrieval
            .registry()
            .list_documents(&ctx.knowledge_base_id)
            .await?;
        if documents.is_empty() {
            return Ok("The knowledge base has no documents.".to_string());
        }

        let lines: Vec<String> = documents
            .iter()
            .map(|doc| {
                format!(
                    "- {} (id {}, type {}, {} chunks, updated {})",
                    doc.title,
                    doc.id,
                    doc.doc_type,
                    doc.chunk_ids.len(),
                    doc.updated_at.format("%Y-%m-%d")
                )
            })
            .collect();
        Ok(format!("{} documents:\n{}", documents.len(), lines.join("\n")))
    }
}

/// Case-insensitive keyword match over titles and content
pub struct SearchDocumentsTool {
    retrieval: Arc<RetrievalEngine>,
}

impl SearchDocumentsTool {
    #[inline]
    pub fn new(retrieval: Arc<RetrievalEngine>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl AgentTool for SearchDocumentsTool {
    #[inline]
    fn name(&self) -> &'static str {
        "search_documents"
    }

    #[inline]
    fn description(&self) -> &'static str {
        "Find documents whose title or text contains a keyword"
    }

    #[inline]
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "keyword": { "type": "string", "description": "Word or phrase to match" }
            },
            "required": ["keyword"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &AgentContext, args: Value) -> Result<String> {
        let keyword = string_arg(&args, "keyword")?.to_lowercase();
        let documents = self
            .retrieval
            .registry()
            .list_documents(&ctx.knowledge_base_id)
            .await?;

        let matches: Vec<String> = documents
            .iter()
            .filter_map(|doc| {
                if let Some(snippet) = keyword_snippet(&doc.content, &keyword) {
                    Some(format!("- {} (id {}): {}", doc.title, doc.id, snippet))
                } else if doc.title.to_lowercase().contains(&keyword) {
                    Some(format!("- {} (id {})", doc.title, doc.id))
                } else {
                    None
                }
            })
            .take(MAX_KEYWORD_MATCHES)
            .collect();

        if matches.is_empty() {
            return Ok(format!("No documents mention '{}'.", keyword));
        }
        Ok(format!(
            "{} documents mention '{}':\n{}",
            matches.len(),
            keyword,
            matches.join("\n")
        ))
    }
}

/// Excerpt around the first case-insensitive occurrence of `keyword`
fn keyword_snippet(content: &str, keyword: &str) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    let needle: Vec<char> = keyword.chars().collect();
    if needle.is_empty() || needle.len() > chars.len() {
        return None;
    }

    let position = chars.windows(needle.len()).position(|window| {
        window
            .iter()
            .zip(&needle)
            .all(|(c, n)| c.to_lowercase().eq(n.to_lowercase()))
    })?;

    let start = position.saturating_sub(SNIPPET_RADIUS);
    let end = (position + needle.len() + SNIPPET_RADIUS).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    snippet = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

/// Hands the model a document's text to summarise
pub struct SummarizeDocumentTool {
    retrieval: Arc<RetrievalEngine>,
}

impl SummarizeDocumentTool {
    #[inline]
    pub fn new(retrieval: Arc<RetrievalEngine>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl AgentTool for SummarizeDocumentTool {
    #[inline]
    fn name(&self) -> &'static str {
        "summarize_document"
    }

    #[inline]
    fn description(&self) -> &'static str {
        "Fetch the text of one document so it can be summarised"
    }

    #[inline]
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": { "type": "string", "description": "Id from list_documents" }
            },
            "required": ["document_id"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &AgentContext, args: Value) -> Result<String> {
        let document_id = string_arg(&args, "document_id")?;
        let document = self.retrieval.registry().get_document(document_id).await?;
        if document.knowledge_base_id != ctx.knowledge_base_id {
            return Err(KbError::NotFound(format!(
                "Document {} in this workspace",
                document_id
            )));
        }

        let total = document.content.chars().count();
        let mut body: String = document.content.chars().take(MAX_DOCUMENT_CHARS).collect();
        if total > MAX_DOCUMENT_CHARS {
            let _ = write!(body, "\n[truncated, {} total chars]", total);
        }
        Ok(format!(
            "Title: {}\nType: {}\nVersion: {}\n\n{}",
            document.title, document.doc_type, document.version, body
        ))
    }
}

/// Name, settings and size of the current workspace
pub struct GetWorkspaceInfoTool {
    retrieval: Arc<RetrievalEngine>,
}

impl GetWorkspaceInfoTool {
    #[inline]
    pub fn new(retrieval: Arc<RetrievalEngine>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl AgentTool for GetWorkspaceInfoTool {
    #[inline]
    fn name(&self) -> &'static str {
        "get_workspace_info"
    }

    #[inline]
    fn description(&self) -> &'static str {
        "Describe the current workspace and the size of its knowledge base"
    }

    #[inline]
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn invoke(&self, ctx: &AgentContext, _args: Value) -> Result<String> {
        let stats = self
            .retrieval
            .registry()
            .stats(&ctx.knowledge_base_id)
            .await?;
        let info = json!({
            "workspace_id": ctx.workspace_id,
            "workspace_name": ctx.workspace_name,
            "knowledge_base_id": ctx.knowledge_base_id,
            "documents": stats.documents,
            "chunks": stats.chunks,
            "ai_provider": ctx.settings.ai_provider,
            "ai_model": ctx.settings.ai_model,
            "message_limit": ctx.settings.message_limit,
        });
        serde_json::to_string_pretty(&info)
            .map_err(|e| KbError::AgentExecution(format!("Failed to encode workspace info: {}", e)))
    }
}
