//! # Beleg CLI
//!
//! The `beleg` binary drives the bookkeeping backend: database
//! initialization, receipt ingestion from JSON files, audit listings,
//! vector re-indexing, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! beleg --config ./config/beleg.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `beleg init` | Create the SQLite database and run schema migrations |
//! | `beleg serve` | Start the HTTP server |
//! | `beleg ingest <file>` | Ingest one receipt (or an array) from a JSON file |
//! | `beleg audit` | List flagged receipts grouped by flag kind |
//! | `beleg stats` | Print store and vector-index counts |
//! | `beleg reindex` | Rebuild the vector index from the relational store |
//! | `beleg seed` | Load a small demo ledger |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use beleg::models::{cents_to_string, ReceiptDraft};
use beleg::reconcile::reindex_sweep;
use beleg::store::ListFilter;
use beleg::{config, ingest, server};

/// Beleg — a local bookkeeping backend with receipt auditing and
/// retrieval-augmented Q&A over a locally hosted language model.
#[derive(Parser)]
#[command(
    name = "beleg",
    about = "Local bookkeeping backend — receipt ingestion, auditing, and Q&A",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/beleg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Start the HTTP server.
    ///
    /// Runs migrations, reconciles the vector index against the store, and
    /// serves the API until terminated.
    Serve,

    /// Ingest receipts from a JSON file.
    ///
    /// The file holds either a single receipt record or an array of them.
    /// Every record runs through validation and the audit engine.
    Ingest {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// List receipts with at least one audit flag, grouped by flag kind.
    Audit,

    /// Print store and vector-index statistics.
    Stats,

    /// Rebuild the vector index from the relational store.
    Reindex,

    /// Load a small demo ledger for trying out the system.
    Seed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = beleg::db::connect(&cfg.store.path).await?;
            beleg::migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { file } => {
            run_ingest(&cfg, &file).await?;
        }
        Commands::Audit => {
            run_audit(&cfg).await?;
        }
        Commands::Stats => {
            run_stats(&cfg).await?;
        }
        Commands::Reindex => {
            let state = server::build_state(&cfg).await?;
            let mut reindexed = 0u64;
            for id in state.store.all_ids().await? {
                ingest::sync_vector(&state.store, state.index.as_ref(), state.embedder.as_ref(), id)
                    .await?;
                reindexed += 1;
            }
            println!("reindex");
            println!("  receipts re-embedded: {}", reindexed);
            println!("ok");
        }
        Commands::Seed => {
            run_seed(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_ingest(cfg: &config::Config, file: &PathBuf) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)?;
    let drafts: Vec<ReceiptDraft> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)?
    } else {
        vec![serde_json::from_str(&content)?]
    };

    let state = server::build_state(cfg).await?;
    reindex_sweep(&state.store, state.index.as_ref(), state.embedder.as_ref()).await?;

    let mut flagged = 0usize;
    let total = drafts.len();
    for draft in drafts {
        let outcome = state.ingestor.ingest(draft).await?;
        let mut notes = Vec::new();
        if outcome.flags.duplicate {
            notes.push("duplicate");
        }
        if outcome.flags.suspicious {
            notes.push("suspicious");
        }
        if outcome.flags.missing_vat {
            notes.push("missing-vat");
        }
        if outcome.flags.math_error {
            notes.push("math-error");
        }
        if notes.is_empty() {
            println!("  receipt {} ingested", outcome.id);
        } else {
            flagged += 1;
            println!("  receipt {} ingested [{}]", outcome.id, notes.join(", "));
        }
    }

    println!("ingest");
    println!("  records: {}", total);
    println!("  flagged: {}", flagged);
    println!("ok");
    Ok(())
}

async fn run_audit(cfg: &config::Config) -> anyhow::Result<()> {
    let pool = beleg::db::connect(&cfg.store.path).await?;
    beleg::migrate::run_migrations(&pool).await?;
    let store = beleg::store::ReceiptStore::new(pool);

    let flagged = store
        .list(&ListFilter {
            flagged_only: true,
            ..Default::default()
        })
        .await?;

    if flagged.is_empty() {
        println!("No flagged receipts.");
        return Ok(());
    }

    println!("{:<6} {:<20} {:<12} {:>10}  FLAGS", "ID", "VENDOR", "DATE", "TOTAL");
    for r in &flagged {
        let mut notes = Vec::new();
        if r.flags.duplicate {
            notes.push("duplicate");
        }
        if r.flags.suspicious {
            notes.push("suspicious");
        }
        if r.flags.missing_vat {
            notes.push("missing-vat");
        }
        if r.flags.math_error {
            notes.push("math-error");
        }
        println!(
            "{:<6} {:<20} {:<12} {:>10}  {}",
            r.id,
            r.vendor,
            r.day,
            cents_to_string(r.total_cents),
            notes.join(", ")
        );
    }
    println!();
    println!("{} flagged receipts", flagged.len());
    Ok(())
}

async fn run_stats(cfg: &config::Config) -> anyhow::Result<()> {
    let state = server::build_state(cfg).await?;
    let summary = state.store.summary().await?;
    let indexed = state.index.len().await?;

    println!("store");
    println!("  receipts:   {}", summary.count);
    println!("  total:      {} {}", cents_to_string(summary.total_cents), cfg.currency);
    println!("  vat total:  {} {}", cents_to_string(summary.vat_cents), cfg.currency);
    println!("  average:    {} {}", cents_to_string(summary.average_cents), cfg.currency);
    println!("vector index");
    println!("  backend:    {}", cfg.vector.backend);
    println!("  documents:  {}", indexed);
    Ok(())
}

/// A handful of plausible receipts so the dashboard and the chat have
/// something to show right after install.
async fn run_seed(cfg: &config::Config) -> anyhow::Result<()> {
    let demo = serde_json::json!([
        {
            "vendor": "REWE",
            "date": "2024-01-15T10:30:00Z",
            "total": 45.67, "tax": 7.32, "currency": "EUR",
            "category": "Groceries",
            "items": [
                {"desc": "Brot", "amount": 2.99},
                {"desc": "Milch", "amount": 1.29},
                {"desc": "Käse", "amount": 41.39}
            ]
        },
        {
            "vendor": "Shell",
            "date": "2024-01-22T08:05:00Z",
            "total": 68.40, "tax": 10.92, "currency": "EUR",
            "category": "Fuel",
            "items": [{"desc": "Diesel 45.6L", "amount": 68.40}]
        },
        {
            "vendor": "Saturn",
            "date": "2024-02-03T14:12:00Z",
            "total": 249.99, "tax": 39.92, "currency": "EUR",
            "category": "Electronics",
            "items": [{"desc": "USB-C Dock", "amount": 249.99}]
        },
        {
            "vendor": "Pub Express",
            "date": "2024-02-09T21:45:00Z",
            "total": 36.50, "tax": 5.83, "currency": "EUR",
            "category": "Meals",
            "items": [
                {"desc": "Burger", "amount": 14.50},
                {"desc": "Craft Beer", "amount": 12.00},
                {"desc": "Fries", "amount": 10.00}
            ]
        },
        {
            "vendor": "Deutsche Bahn",
            "date": "2024-02-19T06:30:00Z",
            "total": 89.90, "tax": 0.00, "currency": "EUR",
            "category": "Travel",
            "items": [{"desc": "ICE Berlin-München", "amount": 89.90}]
        }
    ]);

    let drafts: Vec<ReceiptDraft> = serde_json::from_value(demo)?;
    let state = server::build_state(cfg).await?;

    let mut count = 0usize;
    for draft in drafts {
        let outcome = state.ingestor.ingest(draft).await?;
        println!("  seeded receipt {}", outcome.id);
        count += 1;
    }

    println!("seed");
    println!("  receipts: {}", count);
    println!("ok");
    Ok(())
}
