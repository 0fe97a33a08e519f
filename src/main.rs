use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use keyforge_sync::config::SyncConfig;
use keyforge_sync::database_ops::catalog_store::PgStore;
use keyforge_sync::database_ops::keyforge::{self, next_start_page, RunReport};
use keyforge_sync::database_ops::memory_store::MemoryStore;
use keyforge_sync::logging::init_tracing;
use keyforge_sync::util::{db, env as env_util};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "keyforge-sync",
    version,
    about = "Resumable KeyForge deck catalog sync"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    // Allow `keyforge-sync --pages 5` without the explicit `run` subcommand.
    // If a subcommand is present, these args are ignored.
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync the next batch of catalog pages (default when no command supplied)
    Run(RunArgs),
    /// Print the page the next run would start from
    ResumePoint,
    /// Apply pending schema migrations
    Migrate,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Pages to fetch in this run (overrides KEYFORGE_PAGES_PER_RUN)
    #[arg(long)]
    pages: Option<u32>,
    /// Decks per page (overrides KEYFORGE_PAGE_SIZE)
    #[arg(long)]
    page_size: Option<u32>,
    /// Pause between pages in seconds (overrides KEYFORGE_PAGE_DELAY_SECS)
    #[arg(long)]
    delay_secs: Option<u64>,
    /// Attempts per page for transient failures (overrides KEYFORGE_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Ingest into an in-memory store instead of the database and print the report
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Apply pending migrations before syncing (same as AUTO_MIGRATE=1)
    #[arg(long = "migrate", action = ArgAction::SetTrue)]
    migrate: bool,
}

impl RunArgs {
    fn apply(&self, cfg: &mut SyncConfig) {
        if let Some(pages) = self.pages {
            cfg.pages_per_run = pages;
        }
        if let Some(size) = self.page_size {
            cfg.page_size = size;
        }
        if let Some(secs) = self.delay_secs {
            cfg.page_delay = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.max_attempts {
            cfg.retry.max_attempts = attempts;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing("info")?;

    let cli = Cli::parse();
    match cli.command {
        Some(Command::ResumePoint) => {
            let store = open_store(false).await?;
            let page = next_start_page(&store).await?;
            println!("{page}");
            Ok(())
        }
        Some(Command::Migrate) => {
            let url = env_util::db_url().context("no database URL configured")?;
            let mut conn = db::open_session(&url).await?;
            let applied = db::run_migrations(&mut conn).await?;
            info!(?applied, "migrations complete");
            Ok(())
        }
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut cfg = SyncConfig::from_env();
    args.apply(&mut cfg);
    cfg.validate()?;

    let cancel = install_cancel_handler();

    let report = if args.dry_run {
        warn!("dry run: pages are merged into memory only");
        let store = MemoryStore::new();
        let report = keyforge::sync(&cfg, &store, cancel).await;
        let snapshot = store.snapshot().await;
        info!(
            houses = snapshot.houses.len(),
            cards = snapshot.cards.len(),
            decks = snapshot.decks.len(),
            deck_houses = snapshot.deck_houses.len(),
            deck_cards = snapshot.deck_cards.len(),
            http_calls = store.audit_entries().await.len(),
            "dry run: in-memory catalog"
        );
        report
    } else {
        let migrate = args.migrate || env_util::env_flag("AUTO_MIGRATE", false);
        let store = open_store(migrate).await?;
        keyforge::sync(&cfg, &store, cancel).await
    };

    match report {
        Ok(report) => {
            print_report(&report)?;
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "keyforge sync failed; the next run resumes from the last merged page");
            Err(err)
        }
    }
}

async fn open_store(migrate: bool) -> Result<PgStore> {
    let url = env_util::db_url().context("no database URL configured")?;
    info!(db = %env_util::redact_url(&url), "opening session");
    let mut conn = db::open_session(&url).await?;
    if migrate {
        db::run_migrations(&mut conn).await?;
    }
    PgStore::new(conn)
        .await
        .context("failed to prepare staging tables")
}

/// Ctrl+C raises the cancellation flag; the run stops before its next page.
fn install_cancel_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown: Ctrl+C received; finishing current page");
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "failed to install Ctrl+C handler");
                // Keep the sender alive so the run is not treated as cancelled.
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
