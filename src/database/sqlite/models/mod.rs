
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, Type};

pub const DEFAULT_MESSAGE_LIMIT: i64 = 100;
pub const DEFAULT_AI_PROVIDER: &str = "openai";
pub const DEFAULT_AI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub vector_collection_id: String,
    pub embedding_dimension: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub knowledge_base_id: String,
    pub title: String,
    pub doc_type: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    /// Chunk ids in ordinal order
    pub chunk_ids: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields of a document to ingest
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub doc_type: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct DocumentRow {
    pub id: String,
    pub knowledge_base_id: String,
    pub title: String,
    pub doc_type: String,
    pub content: String,
    pub metadata: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRow {
    pub(crate) fn into_document(self, chunk_ids: Vec<String>) -> Result<Document> {
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)
            .with_context(|| format!("Invalid metadata JSON for document {}", self.id))?;
        Ok(Document {
            id: self.id,
            knowledge_base_id: self.knowledge_base_id,
            title: self.title,
            doc_type: self.doc_type,
            content: self.content,
            metadata,
            chunk_ids,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ChunkRow {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub embedding: Vec<u8>,
}

impl ChunkRow {
    pub(crate) fn into_chunk(self) -> Result<Chunk> {
        let embedding = decode_embedding(&self.embedding)
            .with_context(|| format!("Corrupt embedding for chunk {}", self.id))?;
        Ok(Chunk {
            id: self.id,
            document_id: self.document_id,
            ordinal: self.ordinal,
            text: self.text,
            embedding,
        })
    }
}

/// Little-endian f32 packing used for the `chunks.embedding` column
#[inline]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

#[inline]
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("embedding blob length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Effective per-workspace chat settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    pub message_limit: i64,
    pub ai_provider: String,
    pub ai_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for WorkspaceSettings {
    #[inline]
    fn default() -> Self {
        Self {
            message_limit: DEFAULT_MESSAGE_LIMIT,
            ai_provider: DEFAULT_AI_PROVIDER.to_string(),
            ai_model: DEFAULT_AI_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Settings as stored; unset values fall back to the defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkspaceSettingsOverrides {
    pub message_limit: Option<i64>,
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl WorkspaceSettingsOverrides {
    #[inline]
    pub fn resolve(&self) -> WorkspaceSettings {
        let defaults = WorkspaceSettings::default();
        WorkspaceSettings {
            message_limit: self.message_limit.unwrap_or(defaults.message_limit),
            ai_provider: self
                .ai_provider
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or(defaults.ai_provider),
            ai_model: self
                .ai_model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.ai_model),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub knowledge_base_id: String,
    pub settings: WorkspaceSettingsOverrides,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    #[inline]
    pub fn effective_settings(&self) -> WorkspaceSettings {
        self.settings.resolve()
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct WorkspaceRow {
    pub id: String,
    pub name: String,
    pub knowledge_base_id: String,
    pub message_limit: Option<i64>,
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<WorkspaceRow> for Workspace {
    #[inline]
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            knowledge_base_id: row.knowledge_base_id,
            settings: WorkspaceSettingsOverrides {
                message_limit: row.message_limit,
                ai_provider: row.ai_provider,
                ai_model: row.ai_model,
                max_tokens: row.max_tokens.and_then(|t| u32::try_from(t).ok()),
                temperature: row.temperature.map(|t| t as f32),
            },
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChatTurn {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    #[inline]
    pub fn new(workspace_id: &str, user_id: &str, role: ChatRole, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MessageCounter {
    pub workspace_id: String,
    pub user_id: String,
    pub count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}
