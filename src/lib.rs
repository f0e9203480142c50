use thiserror::Error;

pub type Result<T> = std::result::Result<T, KbError>;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote service error: {0}")]
    RemoteService(String),

    #[error("Vector backend error: {0}")]
    VectorBackend(String),

    #[error("Message limit reached: {count}/{limit}")]
    RateLimitExceeded { count: i64, limit: i64 },

    #[error("Agent execution error: {0}")]
    AgentExecution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl KbError {
    /// Wrap a metadata repository failure, keeping the full context chain.
    #[inline]
    pub fn database(err: anyhow::Error) -> Self {
        Self::Database(format!("{err:#}"))
    }
}

impl From<config::ConfigError> for KbError {
    #[inline]
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub mod agent;
pub mod chat;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod extract;
mod http;
pub mod knowledge;
pub mod retrieval;
#[cfg(test)]
mod test_support;
