use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod import;

use pitchscore_core::{
    build_prompt, load_config, normalize_transcript, BackfillScanner, PitchscoreConfig,
    ReconcileMode, ReconcileOutcome, Reconciler,
};
use pitchscore_judge::create_judge;
use pitchscore_schema::{CompletenessPolicy, RatingState, StoredRating};
use pitchscore_store::{ConversationStore, SqliteConversationStore};

#[derive(Parser)]
#[command(
    name = "pitchscore",
    version,
    about = "Rate recorded sales conversations against a five-part rubric"
)]
struct Cli {
    #[arg(
        long,
        default_value = "~/.pitchscore",
        help = "Root directory (contains config.yaml, data/ and logs/)"
    )]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Rate one conversation unless it already has a complete rating")]
    Rate {
        #[arg(help = "Conversation ID")]
        conversation_id: String,
        #[arg(long, help = "Re-evaluate even if the stored rating is complete")]
        force: bool,
        #[arg(long, help = "Evaluate and print without writing to the store")]
        dry_run: bool,
    },
    #[command(about = "Repair every conversation whose stored rating is incomplete")]
    Backfill {
        #[arg(long, help = "Conversations per page (default from config)")]
        page_size: Option<usize>,
        #[arg(long, help = "Stop after this many pages")]
        max_pages: Option<usize>,
        #[arg(long, help = "Concurrent evaluations (1 = sequential)")]
        workers: Option<usize>,
        #[arg(long, help = "Also rate conversations that have never been rated")]
        include_unrated: bool,
    },
    #[command(about = "Print the exact prompt the judge would receive")]
    Prompt {
        #[arg(help = "Conversation ID")]
        conversation_id: String,
    },
    #[command(about = "Show the stored rating and whether it is complete")]
    Show {
        #[arg(help = "Conversation ID")]
        conversation_id: String,
    },
    #[command(about = "Load conversations from a JSON file into the store")]
    Import {
        #[arg(help = "JSON file with one conversation or an array of them")]
        file: PathBuf,
    },
    #[command(about = "Validate config and judge settings")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Expand ~ to home directory
    if cli.root.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            cli.root = PathBuf::from(home).join(cli.root.strip_prefix("~").unwrap_or(&cli.root));
        }
    }

    let log_dir = cli.root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "pitchscore.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = load_config(&cli.root)?;

    match command {
        Commands::Validate => {
            let judge = create_judge(&config.judge.provider)?;
            println!(
                "Config valid. judge: {} (max_tokens {}, temperature {}), store: {}",
                judge.model(),
                config.judge.max_output_tokens,
                config.judge.temperature,
                config.store_path(&cli.root).display()
            );
        }
        Commands::Import { file } => {
            let store = open_store(&config, &cli.root)?;
            let count = import_file(&store, &file).await?;
            println!("Imported {count} conversations.");
        }
        Commands::Show { conversation_id } => {
            let store = open_store(&config, &cli.root)?;
            let report = show_report(&store, &conversation_id, config.rating).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Prompt { conversation_id } => {
            let store = open_store(&config, &cli.root)?;
            let conversation = store
                .get_conversation(&conversation_id)
                .await?
                .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
            let transcript = normalize_transcript(&conversation.messages)?;
            println!("{}", build_prompt(&transcript));
        }
        Commands::Rate {
            conversation_id,
            force,
            dry_run,
        } => {
            let store = Arc::new(open_store(&config, &cli.root)?);
            let reconciler = build_reconciler(&config, store)?;

            if dry_run {
                let validated = reconciler.preview(&conversation_id).await?;
                let output = serde_json::json!({
                    "record": validated.record,
                    "anomalies": validated.anomalies,
                    "stored": false,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
                return Ok(());
            }

            let mode = if force {
                ReconcileMode::Force
            } else {
                ReconcileMode::IfNeeded
            };
            let output = match reconciler.reconcile(&conversation_id, mode).await? {
                ReconcileOutcome::AlreadyRated(record) => serde_json::json!({
                    "record": record,
                    "anomalies": [],
                    "stored": false,
                }),
                ReconcileOutcome::Rated(validated) => serde_json::json!({
                    "record": validated.record,
                    "anomalies": validated.anomalies,
                    "stored": true,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Backfill {
            page_size,
            max_pages,
            workers,
            include_unrated,
        } => {
            let mut options = config.backfill.clone();
            if let Some(page_size) = page_size {
                options.page_size = page_size;
            }
            if max_pages.is_some() {
                options.max_pages = max_pages;
            }
            if let Some(workers) = workers {
                options.workers = workers;
            }
            options.include_unrated |= include_unrated;
            if options.page_size == 0 || options.workers == 0 {
                return Err(anyhow!("--page-size and --workers must be greater than 0"));
            }

            let store = Arc::new(open_store(&config, &cli.root)?);
            let reconciler = Arc::new(build_reconciler(&config, store.clone())?);
            let report = BackfillScanner::new(reconciler, store, options).run().await?;

            println!(
                "Backfill done. pages={} scanned={} rated={} skipped={} failed={}",
                report.pages,
                report.scanned,
                report.rated,
                report.skipped,
                report.failed()
            );
            for (kind, count) in report.failures_by_kind() {
                println!("  {kind}: {count}");
            }
            for failure in &report.failures {
                println!(
                    "  {} [{}{}] {}",
                    failure.conversation_id,
                    failure.kind,
                    if failure.retryable { ", retryable" } else { "" },
                    failure.message
                );
            }
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct ShowReport {
    id: String,
    messages: usize,
    state: RatingState,
    incomplete: Vec<String>,
    rating: Option<StoredRating>,
}

async fn import_file(store: &SqliteConversationStore, file: &Path) -> Result<usize> {
    let conversations = import::read_conversations(file)?;
    for conversation in &conversations {
        store.insert_conversation(conversation).await?;
    }
    tracing::info!(count = conversations.len(), file = %file.display(), "import finished");
    Ok(conversations.len())
}

async fn show_report(
    store: &SqliteConversationStore,
    conversation_id: &str,
    policy: CompletenessPolicy,
) -> Result<ShowReport> {
    let conversation = store
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
    let incomplete = conversation
        .rating
        .as_ref()
        .map(|r| {
            r.incomplete_reasons(policy)
                .iter()
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(ShowReport {
        state: RatingState::of(conversation.rating.as_ref(), policy),
        messages: conversation.messages.len(),
        id: conversation.id,
        incomplete,
        rating: conversation.rating,
    })
}

fn open_store(config: &PitchscoreConfig, root: &Path) -> Result<SqliteConversationStore> {
    SqliteConversationStore::open(&config.store_path(root))
}

fn build_reconciler(
    config: &PitchscoreConfig,
    store: Arc<SqliteConversationStore>,
) -> Result<Reconciler> {
    let judge = create_judge(&config.judge.provider)?;
    Ok(Reconciler::new(store, judge, config.evaluation_settings()))
}
