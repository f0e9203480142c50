use clap::{Args, Parser, Subcommand};
use kb_rag::Result;
use kb_rag::commands::{
    add_documents, chat, clear_chat, create_knowledge_base, create_workspace, delete_document,
    delete_knowledge_base, list_documents, list_knowledge_bases, list_workspaces, query,
    show_status, update_document,
};
use kb_rag::config::{run_interactive_config, show_config};
use kb_rag::database::sqlite::models::WorkspaceSettingsOverrides;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kb-rag")]
#[command(about = "Workspace knowledge bases with retrieval-augmented chat")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the embedding endpoint and vector backend
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Manage knowledge bases
    #[command(subcommand)]
    Kb(KbCommand),
    /// Manage workspaces
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
    /// Manage documents in a knowledge base
    #[command(subcommand)]
    Doc(DocCommand),
    /// Retrieve the passages most similar to a question
    Query {
        /// Knowledge base ID
        kb: String,
        /// Question to search for
        question: String,
        /// Maximum number of passages
        #[arg(short, long)]
        k: Option<usize>,
        /// Minimum similarity score in [0, 1]
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Chat with a workspace assistant
    Chat {
        /// Workspace ID
        workspace: String,
        /// User ID the message limit is counted against
        user: String,
        /// Send a single message instead of starting an interactive session
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Delete a user's chat history in a workspace
    Clear {
        /// Workspace ID
        workspace: String,
        /// User ID
        user: String,
    },
    /// Show connectivity and index consistency
    Status,
}

#[derive(Subcommand)]
enum KbCommand {
    /// Create a knowledge base
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List knowledge bases with document counts
    List,
    /// Delete a knowledge base, its documents and its vectors
    Delete { id: String },
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    /// Create a workspace with its own knowledge base
    Create {
        name: String,
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// List workspaces and their effective settings
    List,
}

#[derive(Args)]
struct SettingsArgs {
    /// Messages each user may send
    #[arg(long)]
    message_limit: Option<i64>,
    /// Chat provider name from the configuration
    #[arg(long)]
    provider: Option<String>,
    /// Model name passed to the provider
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    temperature: Option<f32>,
}

impl From<SettingsArgs> for WorkspaceSettingsOverrides {
    fn from(args: SettingsArgs) -> Self {
        Self {
            message_limit: args.message_limit,
            ai_provider: args.provider,
            ai_model: args.model,
            max_tokens: args.max_tokens,
            temperature: args.temperature,
        }
    }
}

#[derive(Subcommand)]
enum DocCommand {
    /// Ingest text, markdown or HTML files
    Add {
        /// Knowledge base ID
        kb: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Replace a document's content with a file's text
    Update { id: String, file: PathBuf },
    /// Delete a document and its vectors
    Delete { id: String },
    /// List documents in a knowledge base
    List { kb: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                run_interactive_config()?;
            }
        }
        Commands::Kb(command) => match command {
            KbCommand::Create { name, description } => {
                create_knowledge_base(&name, description.as_deref()).await?;
            }
            KbCommand::List => list_knowledge_bases().await?,
            KbCommand::Delete { id } => delete_knowledge_base(&id).await?,
        },
        Commands::Workspace(command) => match command {
            WorkspaceCommand::Create { name, settings } => {
                create_workspace(&name, settings.into()).await?;
            }
            WorkspaceCommand::List => list_workspaces().await?,
        },
        Commands::Doc(command) => match command {
            DocCommand::Add { kb, files } => add_documents(&kb, &files).await?,
            DocCommand::Update { id, file } => update_document(&id, &file).await?,
            DocCommand::Delete { id } => delete_document(&id).await?,
            DocCommand::List { kb } => list_documents(&kb).await?,
        },
        Commands::Query {
            kb,
            question,
            k,
            threshold,
        } => {
            query(&kb, &question, k, threshold).await?;
        }
        Commands::Chat {
            workspace,
            user,
            message,
        } => {
            chat(&workspace, &user, message).await?;
        }
        Commands::Clear { workspace, user } => {
            clear_chat(&workspace, &user).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
    }

    Ok(())
}
