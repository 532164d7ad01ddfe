//! # Aidkit CLI (`kit`)
//!
//! The `kit` binary is the primary interface for Aidkit. It provides
//! commands for database initialization, knowledge cache sync, retrieval
//! inspection, chatting against the local model, and conversation history
//! management.
//!
//! ## Usage
//!
//! ```bash
//! kit --config ./config/kit.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kit init` | Create the SQLite database and run schema migrations |
//! | `kit sync` | Seed an empty cache and refresh from configured sources |
//! | `kit search "<query>"` | Show the reference context retrieved for a query |
//! | `kit chat "<message>"` | Send one message to the assistant, streaming the reply |
//! | `kit history list` | List conversations, most recently updated first |
//! | `kit history delete <id>` | Delete a conversation |

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use aidkit::assistant::Assistant;
use aidkit::config::{self, Config};
use aidkit::engine::EngineManager;
use aidkit::history::HistoryStore;
use aidkit::retrieve::retrieve;
use aidkit::store::{EntryStore, SqliteEntryStore};
use aidkit::sync::SyncManager;
use aidkit::{db, migrate};

/// Aidkit CLI — a local-first assistant with an offline knowledge cache.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "kit",
    about = "Aidkit — a local-first assistant with an offline knowledge cache",
    version,
    long_about = "Aidkit keeps a versioned reference cache in SQLite, retrieves the entries most \
    relevant to each query under a character budget, and folds them into the system prompt of a \
    locally-hosted chat model. Conversations are recorded with debounced, quota-aware persistence."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kit.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Seed an empty cache and refresh from configured sources.
    ///
    /// Seeding runs only when the cache is empty. Source refresh is
    /// best-effort: a bad source is logged and skipped, and a source whose
    /// version marker is unchanged is not re-ingested.
    Sync,

    /// Show the reference context retrieved for a query.
    ///
    /// Prints exactly what would be folded into the system prompt for this
    /// query, useful for inspecting cache coverage.
    Search {
        /// The query string.
        query: String,
    },

    /// Send one message to the assistant, streaming the reply to stdout.
    ///
    /// Loads the model if it is not already being served, appends the turn
    /// to the current conversation, and persists history on exit.
    Chat {
        /// The user message.
        message: String,
    },

    /// Manage conversation history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

/// History management subcommands.
#[derive(Subcommand)]
enum HistoryAction {
    /// List conversations, most recently updated first.
    List,
    /// Delete a conversation by id.
    Delete {
        /// Conversation UUID.
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync => {
            let store = open_store(&cfg).await?;
            let sync = SyncManager::new(store, cfg.sync.clone());
            let seeded = sync.ensure_seeded().await;
            let refreshed = sync.refresh_from_sources().await;
            match (seeded, refreshed) {
                (false, false) => println!("Cache already up to date."),
                _ => println!("Cache updated."),
            }
        }
        Commands::Search { query } => {
            let store = open_store(&cfg).await?;
            let entries = store.get_all().await?;
            let context = retrieve(&entries, &query, cfg.retrieval.budget_chars);
            if context.is_empty() {
                println!("No cached entries available.");
            } else {
                println!("{context}");
            }
        }
        Commands::Chat { message } => {
            run_chat(&cfg, &message).await?;
        }
        Commands::History { action } => {
            let history = HistoryStore::open_file(&cfg.history_path(), cfg.history.clone());
            match action {
                HistoryAction::List => {
                    for conversation in history.conversations() {
                        let title = conversation.title.as_deref().unwrap_or("(untitled)");
                        println!(
                            "{}  {}  ({} messages)",
                            conversation.id,
                            title,
                            conversation.messages.len()
                        );
                    }
                }
                HistoryAction::Delete { id } => {
                    let id: Uuid = id.parse()?;
                    history.delete_conversation(id);
                    history.flush();
                    println!("Deleted {id}.");
                }
            }
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn EntryStore>> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    Ok(Arc::new(SqliteEntryStore::new(pool)))
}

async fn run_chat(cfg: &Config, message: &str) -> anyhow::Result<()> {
    let store = open_store(cfg).await?;

    // First run works offline as long as a seed document is bundled.
    let sync = SyncManager::new(Arc::clone(&store), cfg.sync.clone());
    sync.ensure_seeded().await;

    let engine = Arc::new(EngineManager::new(cfg.engine.clone()));
    engine
        .initialize(Some(Arc::new(|progress| {
            eprint!("\rLoading model... {:3.0}%", progress * 100.0);
            let _ = std::io::stderr().flush();
        })))
        .await?;
    eprintln!();

    let history = HistoryStore::open_file(&cfg.history_path(), cfg.history.clone());
    let assistant = Assistant::new(store, engine.clone(), history.clone(), cfg);

    assistant
        .answer(message, |token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        })
        .await?;
    println!();

    history.flush();
    engine.teardown().await;
    Ok(())
}
