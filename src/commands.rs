use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::{ConversationalAgent, ModelRegistry, ToolRegistry};
use crate::chat::{SendOutcome, WorkspaceChatSession};
use crate::config::Config;
use crate::database::sqlite::models::WorkspaceSettingsOverrides;
use crate::database::{Database, VectorIndex, VectorIndexHandle};
use crate::embeddings::EmbeddingClient;
use crate::extract::extract_file;
use crate::knowledge::KnowledgeBaseRegistry;
use crate::retrieval::{RetrievalEngine, format_context};
use crate::{KbError, Result};

static VECTOR_INDEX: VectorIndexHandle = VectorIndexHandle::new();

/// Everything a command needs, wired from one configuration
pub struct Services {
    pub config: Config,
    pub registry: Arc<KnowledgeBaseRegistry>,
    pub retrieval: Arc<RetrievalEngine>,
}

impl Services {
    /// Wire services using the process-wide vector client
    #[inline]
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let vectors = VECTOR_INDEX.get_or_connect(&config).await?;
        Self::assemble(config, vectors).await
    }

    /// Wire services around an already connected vector index
    #[inline]
    pub async fn assemble(config: Config, vectors: Arc<dyn VectorIndex>) -> Result<Self> {
        config.validate()?;
        let database = Database::new(config.database_path())
            .await
            .map_err(KbError::database)?;
        let embedder = Arc::new(EmbeddingClient::new(&config.embedding)?);

        let registry = Arc::new(KnowledgeBaseRegistry::new(
            database,
            vectors,
            embedder,
            config.chunking,
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&registry),
            config.retrieval,
        ));

        Ok(Self {
            config,
            registry,
            retrieval,
        })
    }

    #[inline]
    pub async fn open_default() -> Result<Self> {
        Self::open(Config::load_default()?).await
    }

    #[inline]
    pub fn agent(&self) -> Result<ConversationalAgent> {
        let models = ModelRegistry::from_config(&self.config.llm)?;
        let tools = ToolRegistry::with_defaults(Arc::clone(&self.retrieval))?;
        Ok(ConversationalAgent::new(
            Arc::new(models),
            Arc::new(tools),
            self.config.agent,
        ))
    }

    #[inline]
    pub fn chat_session(&self) -> Result<WorkspaceChatSession> {
        Ok(WorkspaceChatSession::new(
            self.registry.database().clone(),
            Arc::new(self.agent()?),
            self.config.chat,
        ))
    }
}

#[inline]
pub async fn create_knowledge_base(name: &str, description: Option<&str>) -> Result<()> {
    let services = Services::open_default().await?;
    let kb = services
        .registry
        .create_knowledge_base(name, description)
        .await?;
    println!("Created knowledge base: {} (ID: {})", kb.name, kb.id);
    println!("Vector collection: {}", kb.vector_collection_id);
    Ok(())
}

#[inline]
pub async fn list_knowledge_bases() -> Result<()> {
    let services = Services::open_default().await?;
    let kbs = services.registry.list_knowledge_bases().await?;

    if kbs.is_empty() {
        println!("No knowledge bases have been created yet.");
        println!("Use 'kb-rag kb create <name>' to create one.");
        return Ok(());
    }

    println!("Knowledge Bases ({} total):", kbs.len());
    println!();
    for kb in &kbs {
        println!("📚 {} (ID: {})", kb.name, kb.id);
        if let Some(description) = &kb.description {
            println!("   {}", description);
        }
        match services.registry.stats(&kb.id).await {
            Ok(stats) => {
                println!("   Documents: {}", stats.documents);
                println!("   Chunks: {}", stats.chunks);
                if usize::try_from(stats.chunks).ok() != Some(stats.vectors) {
                    println!(
                        "   ⚠️  Vector count {} does not match chunk count",
                        stats.vectors
                    );
                }
            }
            Err(e) => println!("   Statistics: Error - {}", e),
        }
        println!(
            "   Created: {}",
            kb.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }
    Ok(())
}

#[inline]
pub async fn delete_knowledge_base(id: &str) -> Result<()> {
    let services = Services::open_default().await?;
    let kb = services.registry.get_knowledge_base(id).await?;
    services.registry.delete_knowledge_base(&kb.id).await?;
    println!("Deleted knowledge base: {} (ID: {})", kb.name, kb.id);
    Ok(())
}

#[inline]
pub async fn create_workspace(name: &str, settings: WorkspaceSettingsOverrides) -> Result<()> {
    let services = Services::open_default().await?;
    let workspace = services.registry.create_workspace(name, settings).await?;
    let effective = workspace.effective_settings();
    println!("Created workspace: {} (ID: {})", workspace.name, workspace.id);
    println!("Knowledge base: {}", workspace.knowledge_base_id);
    println!(
        "Model: {}/{} (limit {} messages per user)",
        effective.ai_provider, effective.ai_model, effective.message_limit
    );
    Ok(())
}

#[inline]
pub async fn list_workspaces() -> Result<()> {
    let services = Services::open_default().await?;
    let workspaces = services.registry.list_workspaces().await?;

    if workspaces.is_empty() {
        println!("No workspaces have been created yet.");
        println!("Use 'kb-rag workspace create <name>' to create one.");
        return Ok(());
    }

    println!("Workspaces ({} total):", workspaces.len());
    println!();
    for workspace in &workspaces {
        let settings = workspace.effective_settings();
        println!("🏫 {} (ID: {})", workspace.name, workspace.id);
        println!("   Knowledge base: {}", workspace.knowledge_base_id);
        println!(
            "   Model: {}/{} (temperature {:.1}, max {} tokens)",
            settings.ai_provider, settings.ai_model, settings.temperature, settings.max_tokens
        );
        println!("   Message limit: {}", settings.message_limit);
        println!();
    }
    Ok(())
}

/// Ingest files into a knowledge base; failures are reported per file and do not stop the batch
#[inline]
pub async fn add_documents(kb_id: &str, paths: &[PathBuf]) -> Result<()> {
    let services = Services::open_default().await?;
    let kb = services.registry.get_knowledge_base(kb_id).await?;

    let bar = if console::user_attended_stderr() && paths.len() > 1 {
        ProgressBar::new(paths.len() as u64).with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] Ingesting {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    } else {
        ProgressBar::hidden()
    };

    let mut added = 0usize;
    let mut failed = 0usize;
    for path in paths {
        bar.set_message(path.display().to_string());
        match services.registry.ingest_file(path, &kb.id).await {
            Ok(document) => {
                added += 1;
                bar.println(format!(
                    "{} {} (ID: {})",
                    style("✓").green(),
                    document.title,
                    document.id
                ));
            }
            Err(e) => {
                failed += 1;
                warn!("Failed to ingest {}: {}", path.display(), e);
                bar.println(format!("{} {}: {}", style("✗").red(), path.display(), e));
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!(
        "Added {} document(s) to {}; {} failed",
        added, kb.name, failed
    );
    if failed > 0 && added == 0 {
        return Err(KbError::Validation(format!(
            "None of the {} file(s) could be ingested",
            failed
        )));
    }
    Ok(())
}

#[inline]
pub async fn update_document(document_id: &str, path: &Path) -> Result<()> {
    let services = Services::open_default().await?;
    let extracted = extract_file(path).await?;
    let document = services
        .registry
        .update_document(document_id, &extracted.text)
        .await?;
    println!(
        "Updated document: {} (ID: {}, version {})",
        document.title, document.id, document.version
    );
    Ok(())
}

#[inline]
pub async fn delete_document(document_id: &str) -> Result<()> {
    let services = Services::open_default().await?;
    let document = services.registry.get_document(document_id).await?;
    services.registry.delete_document(&document.id).await?;
    println!("Deleted document: {} (ID: {})", document.title, document.id);
    Ok(())
}

#[inline]
pub async fn list_documents(kb_id: &str) -> Result<()> {
    let services = Services::open_default().await?;
    let kb = services.registry.get_knowledge_base(kb_id).await?;
    let documents = services.registry.list_documents(&kb.id).await?;

    if documents.is_empty() {
        println!("Knowledge base {} has no documents.", kb.name);
        return Ok(());
    }

    println!("Documents in {} ({} total):", kb.name, documents.len());
    for document in &documents {
        println!(
            "  📄 {} [{}] v{} (ID: {}, updated {})",
            document.title,
            document.doc_type,
            document.version,
            document.id,
            document.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

#[inline]
pub async fn query(
    kb_id: &str,
    question: &str,
    k: Option<usize>,
    threshold: Option<f32>,
) -> Result<()> {
    let services = Services::open_default().await?;
    let defaults = services.retrieval.defaults();
    let items = services
        .retrieval
        .query(
            question,
            kb_id,
            k.unwrap_or(defaults.top_k),
            threshold.unwrap_or(defaults.score_threshold),
        )
        .await?;
    println!("{}", format_context(&items));
    Ok(())
}

/// Send one message, or run an interactive loop when `message` is `None`
#[inline]
pub async fn chat(workspace_id: &str, user_id: &str, message: Option<String>) -> Result<()> {
    let services = Services::open_default().await?;
    let session = services.chat_session()?;

    if let Some(message) = message {
        return send_and_print(&session, workspace_id, user_id, &message).await;
    }

    eprintln!(
        "{}",
        style("Chatting with the workspace assistant. Type 'exit' to leave.").cyan()
    );
    loop {
        let line: String = dialoguer::Input::new()
            .with_prompt("You")
            .allow_empty(true)
            .interact_text()
            .map_err(|e| KbError::Other(e.into()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }
        match send_and_print(&session, workspace_id, user_id, line).await {
            Ok(()) => {}
            Err(e @ KbError::RateLimitExceeded { .. }) => {
                eprintln!("{}", style(e).yellow());
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn send_and_print(
    session: &WorkspaceChatSession,
    workspace_id: &str,
    user_id: &str,
    message: &str,
) -> Result<()> {
    let (sender, mut receiver) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(delta) = receiver.recv().await {
            let _ = write!(stdout, "{}", delta);
            let _ = stdout.flush();
        }
    });

    let outcome = session
        .send_message_streaming(workspace_id, user_id, message, &sender)
        .await;
    drop(sender);
    if let Err(e) = printer.await {
        warn!("Output task failed: {}", e);
    }

    match outcome?.into_result()? {
        SendOutcome::Replied {
            assistant_turn,
            success,
            message_count,
            message_limit,
            ..
        } => {
            // Apologies are not streamed by the model
            if !success {
                print!("{}", assistant_turn.content);
            }
            println!();
            eprintln!(
                "{}",
                style(format!("({}/{} messages used)", message_count, message_limit)).dim()
            );
        }
        SendOutcome::RateLimited { count, limit } => {
            return Err(KbError::RateLimitExceeded { count, limit });
        }
    }
    Ok(())
}

#[inline]
pub async fn clear_chat(workspace_id: &str, user_id: &str) -> Result<()> {
    let services = Services::open_default().await?;
    let removed = services
        .chat_session()?
        .clear_chat(workspace_id, user_id)
        .await?;
    println!("Cleared {} message(s); the message count is unchanged.", removed);
    Ok(())
}

/// Show configuration health and per-knowledge-base counts
#[inline]
pub async fn show_status() -> Result<()> {
    let config = Config::load_default().unwrap_or_default();

    println!("📊 kb-rag Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🗄️  Database Status:");
    let database = match Database::new(config.database_path()).await {
        Ok(db) => {
            println!("   ✅ SQLite: Connected ({})", config.database_path().display());
            Some(db)
        }
        Err(e) => {
            println!("   ❌ SQLite: Failed to connect - {:#}", e);
            None
        }
    };

    println!("🤖 Embedding Endpoint:");
    match EmbeddingClient::new(&config.embedding) {
        Ok(client) => {
            println!("   ✅ {} ({})", config.embedding.base_url, client.model());
            println!("   🔢 Dimension: {}", config.embedding.dimension);
            println!("   📦 Batch Size: {}", client.batch_size());
        }
        Err(e) => println!("   ❌ Misconfigured - {}", e),
    }

    println!("🧠 Chat Providers:");
    match ModelRegistry::from_config(&config.llm) {
        Ok(models) => {
            for provider in models.providers() {
                println!("   • {}", provider);
            }
        }
        Err(e) => println!("   ❌ Misconfigured - {}", e),
    }

    println!("🔍 Vector Backend:");
    let vectors = match VECTOR_INDEX.get_or_connect(&config).await {
        Ok(index) => {
            println!("   ✅ {}: Connected", index.backend_name());
            Some(index)
        }
        Err(e) => {
            println!("   ❌ {}: Failed to connect - {}", config.vector.backend, e);
            None
        }
    };

    if let (Some(database), Some(vectors)) = (database, vectors) {
        println!();
        println!("📚 Knowledge Bases:");
        let embedder = match EmbeddingClient::new(&config.embedding) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                println!("   ❌ Cannot inspect without an embedding client - {}", e);
                return Ok(());
            }
        };
        let registry = KnowledgeBaseRegistry::new(database, vectors, embedder, config.chunking);
        let kbs = registry.list_knowledge_bases().await?;
        if kbs.is_empty() {
            println!("   📭 No knowledge bases yet");
        }
        for kb in &kbs {
            match registry.stats(&kb.id).await {
                Ok(stats) => {
                    let consistent = usize::try_from(stats.chunks).ok() == Some(stats.vectors);
                    println!(
                        "   {} {}: {} documents, {} chunks, {} vectors",
                        if consistent { "✅" } else { "⚠️ " },
                        kb.name,
                        stats.documents,
                        stats.chunks,
                        stats.vectors
                    );
                }
                Err(e) => println!("   ❌ {}: {}", kb.name, e),
            }
        }
        let workspaces = registry.list_workspaces().await?;
        println!("🏫 Workspaces: {}", workspaces.len());
    }

    println!();
    println!("💡 Next Steps:");
    println!("   • Use 'kb-rag workspace create <name>' to set up a workspace");
    println!("   • Use 'kb-rag doc add <kb-id> <files>...' to ingest documents");
    println!("   • Use 'kb-rag chat <workspace-id> <user-id>' to ask questions");

    info!("Status report complete");
    Ok(())
}
