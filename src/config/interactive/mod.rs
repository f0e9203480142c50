
use anyhow::{Context, Result};
use console::style;
use std::fmt::Write as _;
use dialoguer::{Confirm, Input, Select};

use super::{Config, EmbeddingConfig, VectorBackendKind};

#[inline]
pub fn run_interactive_config() -> Result<()> {
    eprintln!("{}", style("🔧 kb-rag Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config()?;

    eprintln!("{}", style("Embedding Endpoint").bold().yellow());
    eprintln!("Configure the OpenAI-compatible endpoint used to embed documents and queries.");
    eprintln!();

    configure_embedding(&mut config.embedding)?;

    eprintln!();
    eprintln!("{}", style("Vector Backend").bold().yellow());
    configure_vector_backend(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    if test_endpoint(&config.embedding) {
        eprintln!("{}", style("✓ Embedding endpoint reachable!").green());
    } else {
        eprintln!(
            "{}",
            style("⚠ Warning: Could not reach the embedding endpoint").yellow()
        );
        eprintln!("You can continue, but make sure it is reachable before ingesting documents.");
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load_default().context("Failed to load configuration")?;
    eprint!("{}", render_config(&config));
    Ok(())
}

fn render_config(config: &Config) -> String {
    let mut out = String::new();
    let mut line = |label: &str, value: String| {
        let _ = writeln!(out, "  {}: {}", label, style(value).cyan());
    };

    line("Embedding URL", config.embedding.base_url.clone());
    line("Embedding model", config.embedding.model.clone());
    line("Embedding dimension", config.embedding.dimension.to_string());
    line("Batch size", config.embedding.batch_size.to_string());
    line(
        "Embedding API key",
        if config.embedding.resolved_api_key().is_some() {
            "set".to_string()
        } else {
            "not set".to_string()
        },
    );
    line("Vector backend", config.vector.backend.to_string());
    if config.vector.backend == VectorBackendKind::Milvus {
        line(
            "Milvus URL",
            config.vector.milvus.url.clone().unwrap_or_default(),
        );
    }
    line(
        "Chunking",
        format!(
            "{} chars, {} overlap",
            config.chunking.chunk_size, config.chunking.chunk_overlap
        ),
    );
    line(
        "Retrieval",
        format!(
            "top {} above {:.2}",
            config.retrieval.top_k, config.retrieval.score_threshold
        ),
    );
    line(
        "Agent budget",
        format!(
            "{} iterations / {}s",
            config.agent.max_iterations, config.agent.timeout_secs
        ),
    );
    for (name, provider) in &config.llm.providers {
        line(&format!("Provider {name}"), provider.base_url.clone());
    }
    line(
        "Config file",
        config.config_file_path().display().to_string(),
    );

    format!(
        "{}\n\n{}",
        style("📋 Current Configuration").bold().cyan(),
        out
    )
}

fn load_existing_config() -> Result<Config> {
    let dir = Config::config_dir().context("Failed to resolve configuration directory")?;
    Config::load(&dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No existing configuration found. Using defaults.").yellow()
            );
            Ok(Config {
                base_dir: dir.clone(),
                ..Config::default()
            })
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn configure_embedding(embedding: &mut EmbeddingConfig) -> Result<()> {
    let base_url: String = Input::new()
        .with_prompt("Embedding base URL")
        .default(embedding.base_url.clone())
        .validate_with(|input: &String| -> Result<(), String> {
            let candidate = EmbeddingConfig {
                base_url: input.clone(),
                ..EmbeddingConfig::default()
            };
            candidate.validate().map_err(|e| e.to_string())
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Embedding model")
        .default(embedding.model.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Model name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let dimension: usize = Input::new()
        .with_prompt("Embedding dimension")
        .default(embedding.dimension)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=8192).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 1 and 8192")
            }
        })
        .interact_text()?;

    let batch_size: usize = Input::new()
        .with_prompt("Batch size for embedding requests")
        .default(embedding.batch_size)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 2048 {
                Err("Batch size must be 2048 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    embedding.base_url = base_url;
    embedding.model = model;
    embedding.dimension = dimension;
    embedding.batch_size = batch_size;

    Ok(())
}

fn configure_vector_backend(config: &mut Config) -> Result<()> {
    let backends = &["lance", "milvus"];
    let default_index = usize::from(config.vector.backend == VectorBackendKind::Milvus);

    let index = Select::new()
        .with_prompt("Vector backend")
        .default(default_index)
        .items(backends)
        .interact()?;

    if index == 1 {
        let url: String = Input::new()
            .with_prompt("Milvus URL")
            .default(
                config
                    .vector
                    .milvus
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:19530".to_string()),
            )
            .interact_text()?;
        config.vector.backend = VectorBackendKind::Milvus;
        config.vector.milvus.url = Some(url);
    } else {
        config.vector.backend = VectorBackendKind::Lance;
    }

    Ok(())
}

fn test_endpoint(embedding: &EmbeddingConfig) -> bool {
    let Some(url) = embedding
        .endpoint_url()
        .ok()
        .and_then(|base| base.join("models").ok())
    else {
        return false;
    };

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(url.as_str()).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}
