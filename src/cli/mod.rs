use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod chat;
pub mod sessions;

use crate::chat::db::SqliteStore;
use crate::chat::{SessionStore, TitleGenerator};
use crate::core::AppConfig;
use crate::openai::CompletionBackend;

#[derive(Subcommand)]
enum Command {
    /// Start an interactive chat
    Chat {
        /// Continue an existing session instead of starting a new one
        #[arg(long)]
        session_id: Option<String>,

        /// Model to use, defaults to LMCHAT_MODEL
        #[arg(long)]
        model: Option<String>,
    },
    /// List saved chat sessions, most recent first
    Sessions {},
    /// Print the transcript of a saved session
    Show {
        #[arg(long)]
        id: String,
    },
    /// Delete a saved session or all of them
    Delete {
        #[arg(long)]
        id: Option<String>,
        #[arg(long, action, default_value = "false")]
        all: bool,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

/// Opens the on-disk session store. Title generation goes through
/// `backend`.
pub fn open_store(
    config: &AppConfig,
    backend: Arc<dyn CompletionBackend>,
) -> Result<SessionStore> {
    let kv = SqliteStore::open(&config.db_path)?;
    Ok(SessionStore::new(Arc::new(kv), TitleGenerator::new(backend)))
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();

    // Logs go to stderr so they don't interleave with streamed output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = AppConfig::default();

    match args.command {
        Some(Command::Chat { session_id, model }) => {
            chat::run(config, session_id, model).await?;
        }
        Some(Command::Sessions {}) => {
            sessions::list(&config)?;
        }
        Some(Command::Show { id }) => {
            sessions::show(&config, &id)?;
        }
        Some(Command::Delete { id, all }) => {
            sessions::delete(&config, id, all)?;
        }
        None => {}
    }

    Ok(())
}
