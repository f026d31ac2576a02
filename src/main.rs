mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use tokio_util::sync::CancellationToken;

use sf_core::config::Config;
use sf_core::events::EventBus;
use sf_db::DbPool;
use sf_pipeline::{command_collaborators, command_fetcher};
use sf_worker::{ItemDetail, NotificationManager, ReviewService, StatusSummary, WorkerContext};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "storyforge=trace,sf_worker=trace,sf_pipeline=debug,sf_db=debug,sf_core=debug".to_string()
        } else {
            "storyforge=info,sf_worker=info,sf_pipeline=info,sf_db=warn,sf_core=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Work { once } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(work(load_config(config_path)?, once))
        }
        Commands::Fetch => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(fetch(load_config(config_path)?))
        }
        Commands::Approve { id } => {
            let item = review(config_path)?.approve(id)?;
            println!("Approved {} \"{}\"", item.id, item.title);
            Ok(())
        }
        Commands::Reject { id, reason } => {
            let item = review(config_path)?.reject(id, reason)?;
            println!("Rejected {} \"{}\"", item.id, item.title);
            Ok(())
        }
        Commands::Retry { id } => {
            let item = review(config_path)?.retry_failed(id)?;
            println!("Re-approved {} \"{}\"; it will restart from the script stage", item.id, item.title);
            Ok(())
        }
        Commands::Republish { attempt_id } => {
            let attempt = review(config_path)?.republish(attempt_id)?;
            println!("Queued attempt {} replacing {attempt_id}", attempt.id);
            Ok(())
        }
        Commands::Status { json } => status(&load_config(config_path)?, json),
        Commands::Show { id, json } => show(&load_config(config_path)?, id, json),
        Commands::Validate { config } => validate_config(config.as_deref().or(config_path)),
        Commands::Version => {
            println!("storyforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = Config::load(path).context("failed to load configuration")?;
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }
    Ok(config)
}

fn open_db(config: &Config) -> Result<DbPool> {
    let db = sf_db::init_pool(&config.database)
        .with_context(|| format!("failed to open database at {}", config.database.path.display()))?;
    tracing::debug!("Database opened at {}", config.database.path.display());
    Ok(db)
}

fn review(config_path: Option<&Path>) -> Result<ReviewService> {
    let config = load_config(config_path)?;
    let db = open_db(&config)?;
    Ok(ReviewService::new(db, Arc::new(config), Arc::new(EventBus::default())))
}

// ---------------------------------------------------------------------------
// work / fetch
// ---------------------------------------------------------------------------

async fn work(config: Config, once: bool) -> Result<()> {
    let db = open_db(&config)?;
    let collaborators = command_collaborators(&config.collaborators)?;
    let notifier = NotificationManager::from_config(&config.notifications).map(Arc::new);
    let ctx = WorkerContext::new(
        db,
        Arc::new(config),
        Arc::new(EventBus::default()),
        collaborators,
    );

    // The notifier outlives the workers so events from their last tasks
    // are still delivered.
    let cancel = CancellationToken::new();
    let notifier_cancel = CancellationToken::new();
    let notifier_handle = notifier.map(|manager| {
        let rx = ctx.event_bus.subscribe();
        tokio::spawn(sf_worker::run_notifier(manager, rx, notifier_cancel.clone()))
    });

    let result = if once {
        drain_once(&ctx, &cancel).await
    } else {
        tracing::info!(concurrency = ctx.config.worker.concurrency, "Starting workers");
        let signal = tokio::spawn(shutdown_signal(cancel.clone()));
        sf_worker::run_workers(ctx, cancel.clone()).await;
        signal.abort();
        Ok(())
    };

    notifier_cancel.cancel();
    if let Some(handle) = notifier_handle {
        let _ = handle.await;
    }
    result
}

async fn drain_once(ctx: &WorkerContext, cancel: &CancellationToken) -> Result<()> {
    sf_worker::requeue_stale(ctx)?;
    let worker_id = format!("{}-once-{}", ctx.config.worker.worker_id, std::process::id());
    let handled = sf_worker::drain(ctx, &worker_id, cancel).await?;
    println!("Processed {handled} task(s)");
    Ok(())
}

async fn fetch(config: Config) -> Result<()> {
    let db = open_db(&config)?;
    let fetcher = command_fetcher(&config.collaborators);
    let bus = EventBus::default();

    let report = sf_worker::ingest(&db, &bus, fetcher.as_ref(), &config.fetch).await?;
    println!(
        "Fetched {}: {} new, {} already known, {} outside length bounds",
        report.fetched, report.inserted, report.duplicates, report.filtered
    );
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then cancel.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// status / show / validate
// ---------------------------------------------------------------------------

fn status(config: &Config, json: bool) -> Result<()> {
    let db = open_db(config)?;
    let conn = sf_db::get_conn(&db)?;
    let summary = StatusSummary::load(&conn, 20)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Items:");
    for (status, count) in &summary.items {
        println!("  {:<18} {count}", status.as_str());
    }
    println!("\nTasks:");
    for (status, count) in &summary.tasks {
        println!("  {:<18} {count}", status.as_str());
    }

    if !summary.pending_review.is_empty() {
        println!("\nAwaiting review:");
        for item in &summary.pending_review {
            println!("  {}  {} ({} chars)", item.id, item.title, item.char_count);
        }
    }
    if !summary.needs_attention.is_empty() {
        println!("\nNeeds attention:");
        for item in &summary.needs_attention {
            println!("  {}  {} [{}]", item.id, item.title, item.status);
        }
    }
    if !summary.manual_required.is_empty() {
        println!("\nManual publishing required:");
        for attempt in &summary.manual_required {
            println!(
                "  {}  part {}  {}",
                attempt.id,
                attempt.part_id,
                attempt.error.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn show(config: &Config, id: sf_core::SourceItemId, json: bool) -> Result<()> {
    let db = open_db(config)?;
    let conn = sf_db::get_conn(&db)?;
    let detail = ItemDetail::load(&conn, id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let item = &detail.item;
    println!("{}  {}", item.id, item.title);
    println!("  Source:   {}/{}", item.source, item.external_id);
    println!("  Status:   {}{}", item.status, if item.needs_attention { " (needs attention)" } else { "" });
    if let Some(err) = &item.error {
        println!("  Error:    {err}");
    }
    if let Some(reason) = &item.rejection_reason {
        println!("  Rejected: {reason}");
    }
    if let Some(batch) = &detail.batch {
        println!(
            "  Batch:    {} {}/{} published, failed parts {:?}",
            batch.status, batch.completed_parts, batch.total_parts, batch.failed_indices
        );
    }

    for part in &detail.parts {
        println!("\n  Part {}/{}", part.part_index, part.total_parts);
        println!("    audio: {}", part.audio_path.as_deref().unwrap_or("-"));
        println!("    video: {}", part.video_path.as_deref().unwrap_or("-"));
        for attempt in detail.attempts.iter().filter(|a| a.part_id == part.id) {
            println!(
                "    attempt {} {} retries={} {}",
                attempt.id,
                attempt.status,
                attempt.retry_count,
                attempt
                    .platform_url
                    .as_deref()
                    .or(attempt.error.as_deref())
                    .unwrap_or("")
            );
        }
    }

    if !detail.runs.is_empty() {
        println!("\n  Runs:");
        for run in &detail.runs {
            println!(
                "    {} {} stage={} {}",
                run.started_at,
                run.status,
                run.current_stage.as_deref().unwrap_or("-"),
                run.error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let Some(path) = path else {
        println!("No config file specified, using defaults");
        report_warnings(&Config::default());
        return Ok(());
    };

    println!("Validating config: {}", path.display());
    if !path.exists() {
        anyhow::bail!("Config file does not exist: {}", path.display());
    }
    let config = Config::load(Some(path))?;
    println!("✓ Configuration is valid");
    println!("  Database: {}", config.database.path.display());
    println!("  Workers: {}", config.worker.concurrency);
    println!(
        "  Publish: {} (daily limit {})",
        config.publish.platform,
        config
            .publish
            .daily_limit
            .map(|n| n.to_string())
            .unwrap_or_else(|| "none".into())
    );
    report_warnings(&config);
    Ok(())
}

fn report_warnings(config: &Config) {
    let warnings = config.validate();
    if warnings.is_empty() {
        println!("  No warnings");
    }
    for warning in warnings {
        println!("  ! {warning}");
    }
}
