//! # Knowledge Base Curator CLI (`kbc`)
//!
//! Upload bureau documents, run staged AI extraction, review and commit the
//! results, and query the knowledge base.
//!
//! ## Usage
//!
//! ```bash
//! kbc --config ./config/kbc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbc init` | Create the SQLite database and run schema migrations |
//! | `kbc serve` | Start the HTTP API |
//! | `kbc upload <file>` | Upload a plain-text document |
//! | `kbc documents` | List documents with staging counts |
//! | `kbc process <id>` | Run extraction, printing one JSON event per line |
//! | `kbc staged <id>` | List staged items of a document |
//! | `kbc verify <action> <ids..>` | Verify, reject or reset staged items |
//! | `kbc commit <id>` | Commit verified items into the knowledge base |
//! | `kbc ask "<question>"` | Cited answer from the knowledge base |
//! | `kbc search "<query>"` | Structured search over rules, QA and chunks |
//! | `kbc add "<text>"` | Add knowledge directly from free text |
//! | `kbc correct "<text>"` | Correct existing rules from free text |
//! | `kbc reset-stale` | Fail documents stuck in PROCESSING |
//! | `kbc domains list\|add` | Manage the domain tree |
//! | `kbc rules list\|history\|deprecate` | Inspect and retire rules |
//! | `kbc questions list\|answer\|dismiss` | Handle open AI questions |
//!
//! ## Examples
//!
//! ```bash
//! kbc init
//! kbc domains add pricing "Цены и тарифы"
//! kbc upload ./notes/pricing.txt --title "Прайс 2024"
//! kbc process 6f1c...
//! kbc verify verify 1a2b... 3c4d...
//! kbc commit 6f1c...
//! kbc ask "Сколько стоит срочный перевод?"
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kb_curator::{commands, config, migrate, server};

/// Knowledge base curator: staged AI extraction with human verification.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "kbc",
    about = "Knowledge base curator: staged AI extraction, human verification and retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Upload a plain-text document.
    Upload {
        /// Path to a UTF-8 text file.
        file: PathBuf,

        /// Document title. Defaults to the file name.
        #[arg(long)]
        title: Option<String>,
    },

    /// List documents with their status and staging counts.
    Documents,

    /// Run the three extraction phases on a document.
    Process {
        /// Document UUID.
        id: String,
    },

    /// List staged items of a document.
    Staged {
        /// Document UUID.
        id: String,

        /// Only items in this review state: `pending`, `verified` or `rejected`.
        #[arg(long)]
        status: Option<String>,
    },

    /// Change the review state of staged items.
    Verify {
        /// `verify`, `reject` or `reset`.
        action: String,

        /// Staged item UUIDs.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Commit a document's verified items into the knowledge base.
    Commit {
        /// Document UUID.
        id: String,
    },

    /// Answer a question with citations.
    Ask {
        question: String,
    },

    /// Structured search over rules, Q&A pairs and chunks.
    Search {
        query: String,

        /// Restrict to one domain slug.
        #[arg(long)]
        domain: Option<String>,

        /// Maximum results per kind (1..=50).
        #[arg(long)]
        limit: Option<usize>,

        /// Only knowledge created on or after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,
    },

    /// Add rules and Q&A pairs from free text, bypassing staging.
    Add {
        text: String,

        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Rewrite existing rules in place from a free-text correction.
    Correct {
        text: String,

        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Mark documents stuck in PROCESSING as FAILED.
    ResetStale,

    /// Manage the domain tree.
    Domains {
        #[command(subcommand)]
        action: DomainAction,
    },

    /// Inspect and retire rules.
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Handle open questions raised during extraction.
    Questions {
        #[command(subcommand)]
        action: QuestionAction,
    },
}

#[derive(Subcommand)]
enum DomainAction {
    List,
    Add {
        slug: String,
        title: String,

        #[arg(long)]
        description: Option<String>,

        /// Slug of the parent domain.
        #[arg(long)]
        parent: Option<String>,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    List {
        /// `active`, `superseded` or `deprecated`.
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// All versions of a rule code with their change records.
    History {
        /// Rule code, e.g. `R-12`.
        code: String,
    },
    Deprecate {
        /// Rule UUID.
        id: String,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long, default_value = "cli")]
        by: String,
    },
}

#[derive(Subcommand)]
enum QuestionAction {
    List,
    Answer { id: String, response: String },
    Dismiss { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Upload { file, title } => {
            commands::run_upload(&cfg, &file, title).await?;
        }
        Commands::Documents => {
            commands::run_documents(&cfg).await?;
        }
        Commands::Process { id } => {
            commands::run_process(&cfg, &id).await?;
        }
        Commands::Staged { id, status } => {
            commands::run_staged(&cfg, &id, status).await?;
        }
        Commands::Verify { action, ids } => {
            commands::run_verify(&cfg, &action, &ids).await?;
        }
        Commands::Commit { id } => {
            commands::run_commit(&cfg, &id).await?;
        }
        Commands::Ask { question } => {
            commands::run_ask(&cfg, &question).await?;
        }
        Commands::Search {
            query,
            domain,
            limit,
            since,
        } => {
            commands::run_search(&cfg, &query, domain, limit, since).await?;
        }
        Commands::Add { text, by } => {
            commands::run_add(&cfg, &text, &by).await?;
        }
        Commands::Correct { text, by } => {
            commands::run_correct(&cfg, &text, &by).await?;
        }
        Commands::ResetStale => {
            commands::run_reset_stale(&cfg).await?;
        }
        Commands::Domains { action } => match action {
            DomainAction::List => commands::run_domains_list(&cfg).await?,
            DomainAction::Add {
                slug,
                title,
                description,
                parent,
            } => {
                commands::run_domains_add(
                    &cfg,
                    &slug,
                    &title,
                    description.as_deref(),
                    parent.as_deref(),
                )
                .await?
            }
        },
        Commands::Rules { action } => match action {
            RuleAction::List { status, limit } => {
                commands::run_rules_list(&cfg, status, limit).await?
            }
            RuleAction::History { code } => commands::run_rules_history(&cfg, &code).await?,
            RuleAction::Deprecate { id, reason, by } => {
                commands::run_rules_deprecate(&cfg, &id, reason.as_deref(), &by).await?
            }
        },
        Commands::Questions { action } => match action {
            QuestionAction::List => commands::run_questions_list(&cfg).await?,
            QuestionAction::Answer { id, response } => {
                commands::run_questions_answer(&cfg, &id, &response).await?
            }
            QuestionAction::Dismiss { id } => commands::run_questions_dismiss(&cfg, &id).await?,
        },
    }

    Ok(())
}
