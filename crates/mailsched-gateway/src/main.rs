use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mailsched_core::{
    config::{MailschedConfig, MEMORY_DB},
    dispatch_queue, EventId, HealthRegistry, RecipientsInput, SubmitRequest,
};
use mailsched_delivery::{transport_from_config, DeliveryWorker, RetryPolicy, WorkerPool};
use mailsched_scheduler::{Dispatcher, DispatcherSettings};
use mailsched_store::EventStore;
use tokio::sync::watch;
use tracing::{error, info};

mod app;
mod http;
mod logging;

#[derive(Parser)]
#[command(name = "mailsched")]
#[command(version, about = "Scheduled email delivery service", long_about = None)]
struct Cli {
    /// Path to mailsched.toml (default: ~/.mailsched/mailsched.toml)
    #[arg(short, long, env = "MAILSCHED_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher, delivery workers and HTTP API (default)
    Serve,

    /// Create the database schema and exit
    InitDb,

    /// Schedule one email
    Submit {
        #[arg(long)]
        subject: String,

        #[arg(long)]
        content: String,

        /// When to send, e.g. 2026-03-01T09:00:00+08:00 or "01 Mar 2026 09:00"
        #[arg(long)]
        at: String,

        /// Comma-separated addresses
        #[arg(long)]
        recipients: String,
    },

    /// Print one event as JSON
    Status { id: EventId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config / MAILSCHED_CONFIG > ~/.mailsched/mailsched.toml
    let config = MailschedConfig::load(cli.config.as_deref()).context("loading config")?;
    logging::init(&config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::InitDb => {
            open_store(&config)?;
            info!(path = %config.database.path, "database schema ready");
            Ok(())
        }
        Command::Submit {
            subject,
            content,
            at,
            recipients,
        } => {
            let store = open_store(&config)?;
            let req = SubmitRequest {
                subject,
                content,
                timestamp: at,
                recipients: RecipientsInput::Joined(recipients),
            };
            let new = req.validate(config.submission.zone()?)?;
            let id = store.create(&new)?;
            println!("{id}");
            Ok(())
        }
        Command::Status { id } => {
            let store = open_store(&config)?;
            let event = store.get(id)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
    }
}

async fn serve(config: MailschedConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!(profile = %config.profile, "starting mailsched");

    let store = open_store(&config)?;
    let health = HealthRegistry::shared(Duration::from_secs(config.health.stale_after_secs));
    let transport = transport_from_config(&config)?;
    let (queue_tx, queue_rx) = dispatch_queue(config.delivery.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(transport = transport.name(), workers = config.delivery.workers, "starting delivery workers");
    let worker = DeliveryWorker::new(
        Arc::clone(&store),
        transport,
        RetryPolicy::from_config(&config.delivery),
        config.delivery.send_timeout(),
        queue_tx.clone(),
    );
    let pool = WorkerPool::spawn(
        config.delivery.workers,
        worker,
        queue_rx,
        Arc::clone(&health),
        shutdown_rx.clone(),
    );

    // dispatcher loop in background, stopped through the same watch channel
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        queue_tx,
        DispatcherSettings::from_config(&config),
        Arc::clone(&health),
    );
    let dispatcher = tokio::spawn(dispatcher.run(shutdown_rx));

    let zone = config.submission.zone()?;
    let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
    let state = Arc::new(app::AppState::new(config, store, health, zone));
    let router = app::build_router(state);

    info!("mailsched listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop dispatcher first so nothing new is claimed, then let workers finish
    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher.await {
        error!("dispatcher task panicked: {e}");
    }
    pool.join().await;
    info!("mailsched stopped");
    Ok(())
}

fn open_store(config: &MailschedConfig) -> anyhow::Result<Arc<EventStore>> {
    let path = &config.database.path;
    if path != MEMORY_DB {
        ensure_parent_dir(path);
    }
    info!(path = %path, "opening SQLite database");
    let store = EventStore::open(path, config.database.busy_timeout_ms)
        .with_context(|| format!("opening database {path}"))?;
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
