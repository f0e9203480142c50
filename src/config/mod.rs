// Configuration management module
// TOML settings under the platform config directory plus the interactive setup

pub mod interactive;
pub mod settings;

pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    AgentConfig, ChatConfig, Config, ConfigError, EmbeddingConfig, LlmConfig, MilvusConfig,
    ProviderConfig, RetrievalConfig, VectorBackendKind, VectorConfig,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
