use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use folder_chat::chat::ChatService;
use folder_chat::config::AppConfig;
use folder_chat::history::ChatStore;
use folder_chat::logging;
use folder_chat::server;

/// Ask questions about the documents in a folder, answered by Gemini over a vector index
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// SQLite database holding users and chat history
    #[arg(long, env = "DATABASE_URL", default_value = "chatbot.db", global = true)]
    database: String,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:5000")]
        bind: SocketAddr,
    },
    /// Create the database tables
    Migrate,
    /// Re-embed every document of a folder
    Retrain { folder_id: String },
    /// Answer one question about a folder, building its index if needed
    Ask {
        folder_id: String,
        question: String,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    logging::init(args.log_file.as_deref())?;

    let store = ChatStore::connect(&args.database)
        .await
        .with_context(|| format!("Failed to open database {}", args.database))?;
    store.migrate().await.context("Failed to create tables")?;

    if let Command::Migrate = args.command {
        return Ok(());
    }

    let config = AppConfig::from_env()?;
    let engine = config.build_engine()?;

    match args.command {
        Command::Serve { bind } => {
            let service = Arc::new(ChatService::new(Arc::new(engine), store));
            server::serve(service, bind).await?;
        }
        Command::Retrain { folder_id } => {
            engine
                .retrain(&folder_id)
                .await
                .with_context(|| format!("Failed to re-train folder {}", folder_id))?;
            info!("Folder re-trained successfully");
        }
        Command::Ask {
            folder_id,
            question,
            temperature,
        } => {
            let index = engine
                .prepare_index(&folder_id, false)
                .await
                .context("Failed to prepare index")?;
            let answer = engine
                .answer(&question, &index, temperature)
                .await
                .context("Failed to answer question")?;
            println!("{}", answer.formatted());
        }
        Command::Migrate => {}
    }

    Ok(())
}
