//! # Simplify Harness CLI (`spx`)
//!
//! The `spx` binary is the operator interface for the simplification
//! pipeline. It provides commands for database initialization, fragment
//! extraction, batch simplification runs, text inspection, and the
//! progress server.
//!
//! ## Usage
//!
//! ```bash
//! spx --config ./config/spx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `spx init` | Create the SQLite database and run schema migrations |
//! | `spx status` | Show text counts, coverage, and runs in flight |
//! | `spx extract <type> <id>` | Extract fragments from a content object |
//! | `spx simplify <type> <id>` | Run one simplification batch for an object |
//! | `spx simplify --all` | Run batches for all eligible objects (scheduler entry) |
//! | `spx texts` | List stored texts |
//! | `spx reset` | Reset record states or clear all simplifications |
//! | `spx serve` | Start the progress HTTP server |

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;

use simplify_harness::api::create_api;
use simplify_harness::config::{load_config, Config};
use simplify_harness::db;
use simplify_harness::extract::extract_object;
use simplify_harness::markers::RunState;
use simplify_harness::migrate;
use simplify_harness::models::ObjectRef;
use simplify_harness::objects::{ContentStore, JsonContentStore};
use simplify_harness::orchestrator::{Orchestrator, RunOptions, RunOutcome, StaleDecision};
use simplify_harness::parser::ParserRegistry;
use simplify_harness::progress::ProgressMode;
use simplify_harness::stats;
use simplify_harness::store::{QueryOrder, StoreOptions, TextQuery, TextStore};

/// Simplify Harness CLI — a batch text-simplification pipeline for
/// easy-language content.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/spx.example.toml` for a full example.
#[derive(ClapParser)]
#[command(
    name = "spx",
    about = "Simplify Harness — a batch text-simplification pipeline for easy-language content",
    version,
    long_about = "Simplify Harness extracts text fragments from content objects, stores each \
    original once (deduplicated by content hash), sends due texts to a pluggable external \
    simplification API, and splices the returned easy-language text back into the objects' \
    derived copies."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/spx.toml`. Database, API, language, and
    /// server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/spx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (texts,
    /// text_usages, simplifications, run_markers). This command is
    /// idempotent — running it multiple times is safe.
    Init,

    /// Show pipeline status.
    ///
    /// Prints text counts per lifecycle state, simplification coverage
    /// per target language, and runs currently in flight.
    Status,

    /// Extract text fragments from a content object.
    ///
    /// Resolves the object's parser, collects its fragments, deduplicates
    /// them against the store by content hash, and records usage links.
    /// Re-extracting diffs: fragments no longer present lose their link.
    Extract {
        /// Object type (e.g. `page`, `post`, `term`).
        object_type: String,
        /// Object id.
        id: i64,
    },

    /// Run one simplification batch.
    ///
    /// Guards against concurrent runs on the same object, checks for work
    /// left behind by a crashed run, prechecks the API quota, then sends
    /// each due text to the API and splices results into the object's
    /// simplified copies.
    Simplify {
        /// Object type (e.g. `page`); omit with --all.
        object_type: Option<String>,
        /// Object id; omit with --all.
        id: Option<i64>,

        /// Run batches for every eligible simplifiable object instead of
        /// a single one. This is what a cron scheduler calls.
        #[arg(long)]
        all: bool,

        /// Maximum texts to process in this call (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        limit: u64,

        /// Continue a paginated run instead of starting a new one
        /// (skips the guard/recovery/quota phase).
        #[arg(long)]
        page: bool,

        /// Resolve texts stuck in `processing` from a crashed run, then
        /// exit: `retry` re-queues them, `ignore` excludes them.
        #[arg(long, value_name = "retry|ignore")]
        resolve_stale: Option<String>,

        /// Operator id recorded on produced simplifications (0 = system).
        #[arg(long, default_value_t = 0)]
        user: i64,

        /// Progress output: `auto`, `off`, `human`, or `json`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// List stored texts.
    Texts {
        /// Filter by state: `to_simplify`, `processing`, `in_use`, `ignore`.
        #[arg(long)]
        state: Option<String>,

        /// Only texts linked to this object type.
        #[arg(long)]
        object_type: Option<String>,

        /// Only texts linked to this object id.
        #[arg(long)]
        object_id: Option<i64>,

        /// Maximum number of rows.
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },

    /// Reset record states or clear simplifications.
    Reset {
        /// Bulk-clear the simplifications table. Irreversible.
        #[arg(long)]
        all_simplifications: bool,

        /// Reset one record back to `to_simplify` (or to `ignore` with
        /// --ignore).
        #[arg(long)]
        record: Option<String>,

        /// With --record: exclude the record instead of re-queueing it.
        #[arg(long)]
        ignore: bool,
    },

    /// Start the progress HTTP server.
    ///
    /// Exposes run markers via `GET /objects/{type}/{id}/progress` for
    /// dialogs and dashboards polling a batch run.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Status => stats::run_status(&config).await,
        Commands::Extract { object_type, id } => run_extract(&config, &object_type, id).await,
        Commands::Simplify {
            object_type,
            id,
            all,
            limit,
            page,
            resolve_stale,
            user,
            progress,
        } => {
            run_simplify(
                &config,
                object_type,
                id,
                all,
                limit,
                page,
                resolve_stale,
                user,
                &progress,
            )
            .await
        }
        Commands::Texts {
            state,
            object_type,
            object_id,
            limit,
        } => run_texts(&config, state, object_type, object_id, limit).await,
        Commands::Reset {
            all_simplifications,
            record,
            ignore,
        } => run_reset(&config, all_simplifications, record, ignore).await,
        Commands::Serve => simplify_harness::server::run_server(&config).await,
    }
}

async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("initialized {}", config.db.path.display());
    Ok(())
}

fn open_content(config: &Config) -> Result<JsonContentStore> {
    let path = config
        .content
        .path
        .clone()
        .context("content.path must be set in config for commands that touch content objects")?;
    JsonContentStore::open(path)
}

async fn run_extract(config: &Config, object_type: &str, id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = TextStore::new(pool.clone(), StoreOptions::from_config(config));
    let content = open_content(config)?;
    let parsers = ParserRegistry::with_builtins();

    let obj_ref = ObjectRef::new(id, object_type);
    let Some(object) = content.get(&obj_ref).await? else {
        bail!("object not found: {}", obj_ref);
    };

    let report = extract_object(&store, &content, &parsers, &object).await?;

    println!("extract {}", obj_ref);
    println!("  created: {}", report.created);
    println!("  linked: {}", report.linked);
    println!(
        "  skipped (already simplifications): {}",
        report.skipped_simplifications
    );
    println!("  removed stale links: {}", report.removed);
    println!("ok");

    pool.close().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_simplify(
    config: &Config,
    object_type: Option<String>,
    id: Option<i64>,
    all: bool,
    limit: u64,
    page: bool,
    resolve_stale: Option<String>,
    user: i64,
    progress: &str,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = TextStore::new(pool.clone(), StoreOptions::from_config(config));
    let content = open_content(config)?;
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());
    let api = create_api(&config.api)?;

    let mode = match progress {
        "auto" => ProgressMode::default_for_tty(),
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        other => bail!("Unknown progress mode: '{}'", other),
    };
    let reporter = mode.reporter();

    let orchestrator =
        Orchestrator::new(&store, &content, &parsers, &run_state).with_reporter(reporter.as_ref());

    if all {
        let processed = orchestrator
            .run_automatic(api.as_ref(), &config.languages.mappings, limit)
            .await?;
        println!("simplify --all");
        println!("  texts processed: {}", processed);
        println!("ok");
        pool.close().await;
        return Ok(());
    }

    let (object_type, id) = match (object_type, id) {
        (Some(t), Some(i)) => (t, i),
        _ => bail!("specify an object (`spx simplify page 12`) or pass --all"),
    };
    let obj_ref = ObjectRef::new(id, &object_type);

    if let Some(decision) = resolve_stale {
        let decision = match decision.as_str() {
            "retry" => StaleDecision::Retry,
            "ignore" => StaleDecision::Ignore,
            other => bail!("--resolve-stale must be retry or ignore, got '{}'", other),
        };
        let updated = orchestrator.resolve_stale(&obj_ref, decision).await?;
        println!("resolved {} stale record(s) for {}", updated, obj_ref);
        pool.close().await;
        return Ok(());
    }

    let Some(object) = content.get(&obj_ref).await? else {
        bail!("object not found: {}", obj_ref);
    };

    let processed = orchestrator
        .run_batch(
            &object,
            api.as_ref(),
            &config.languages.mappings,
            RunOptions {
                limit,
                is_init: !page,
                user_id: user,
            },
        )
        .await?;

    let marker = run_state.progress(&obj_ref.marker_hash()).await?;
    println!("simplify {}", obj_ref);
    println!("  texts processed: {}", processed);
    if let Some(result) = marker.result {
        if let Ok(outcome) = serde_json::from_value::<RunOutcome>(result) {
            println!("  {}", outcome.message());
        }
    } else if marker.running > 0 {
        println!(
            "  {} / {} done — run again with --page to continue",
            marker.count, marker.max
        );
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

async fn run_texts(
    config: &Config,
    state: Option<String>,
    object_type: Option<String>,
    object_id: Option<i64>,
    limit: u64,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = TextStore::new(pool.clone(), StoreOptions::from_config(config));

    let state = match state {
        Some(raw) => match simplify_harness::models::TextState::parse(&raw) {
            Some(s) => Some(s),
            None => bail!(
                "Unknown state '{}'. Must be to_simplify, processing, in_use, or ignore.",
                raw
            ),
        },
        None => None,
    };

    let object = match (object_id, object_type) {
        (Some(id), Some(t)) => Some(ObjectRef::new(id, t)),
        (None, None) => None,
        _ => bail!("--object-type and --object-id must be used together"),
    };

    let records = store
        .query(&TextQuery {
            state,
            object,
            order: QueryOrder::CreatedDesc,
            limit,
            ..Default::default()
        })
        .await?;

    println!(
        "{:<38} {:<12} {:<6} {:<8} TEXT",
        "ID", "STATE", "LANG", "FIELD"
    );
    for record in &records {
        let excerpt: String = record.original.chars().take(48).collect();
        println!(
            "{:<38} {:<12} {:<6} {:<8} {}",
            record.id, record.state, record.source_language, record.field, excerpt
        );
    }
    println!();
    println!("{} text(s)", records.len());

    pool.close().await;
    Ok(())
}

async fn run_reset(
    config: &Config,
    all_simplifications: bool,
    record: Option<String>,
    ignore: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = TextStore::new(pool.clone(), StoreOptions::from_config(config));

    if all_simplifications {
        let removed = store.reset_all_simplifications().await?;
        println!("removed {} simplification(s)", removed);
        pool.close().await;
        return Ok(());
    }

    let Some(record_id) = record else {
        bail!("pass --all-simplifications or --record <id>");
    };
    let Some(mut record) = store.get(&record_id).await? else {
        bail!("text not found: {}", record_id);
    };

    let target = if ignore { "ignore" } else { "to_simplify" };
    store.set_state_raw(&mut record, target).await?;
    println!("{} -> {}", record.id, record.state);

    pool.close().await;
    Ok(())
}
