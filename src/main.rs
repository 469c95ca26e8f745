use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use substrate::api::api_routes;
use substrate::config::Config;
use substrate::events::{ActionExecutor, EventRouter, EventTasks};
use substrate::integrations::{EmailConfig, EmailSync, EmailTasks, ImapMailSource};
use substrate::notes::VaultNotes;
use substrate::store::{Database, LibSqlBackend};
use substrate::worker::{DurableQueue, LaneSet, Scheduler, SchedulerSource, TaskQueue, TaskRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    // ── Tracing ─────────────────────────────────────────────────────────
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "substrate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("Substrate worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Vault: {}", config.vault_path.display());
    eprintln!("   Lanes: {}", config.queues.join(", "));

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    for (email, owner) in &config.inboxes {
        store
            .upsert_inbox(email, owner)
            .await
            .with_context(|| format!("failed to seed inbox {email}"))?;
    }
    if !config.inboxes.is_empty() {
        tracing::info!(count = config.inboxes.len(), "Inboxes seeded");
    }

    // ── Routing ──────────────────────────────────────────────────────────
    let notes = Arc::new(VaultNotes::new(config.vault_path.clone()));
    notes
        .ensure_dirs()
        .await
        .with_context(|| format!("failed to create vault at {}", config.vault_path.display()))?;
    let queue: Arc<dyn TaskQueue> =
        Arc::new(DurableQueue::new(Arc::clone(&store)).with_known_queues(config.queues.clone()));
    let executor = Arc::new(ActionExecutor::new(
        Arc::clone(&store),
        notes,
        Arc::clone(&queue),
    ));
    let router = Arc::new(EventRouter::new(Arc::clone(&store), executor));

    // ── Collaborators ────────────────────────────────────────────────────
    let email_tasks = match EmailConfig::from_env() {
        Some(cfg) => {
            eprintln!("   Email: {}:{} as {}", cfg.imap_host, cfg.imap_port, cfg.username);
            let (poll, max) = (cfg.poll_interval_secs, cfg.max_poll_interval_secs);
            let sync = EmailSync::new(Arc::new(ImapMailSource::new(cfg)), Arc::clone(&router));
            EmailTasks::new(Some(Arc::new(sync))).with_intervals(poll, max)
        }
        None => EmailTasks::new(None),
    };
    let event_tasks = EventTasks::new(Arc::clone(&router), config.sweep_interval_secs);

    // ── Task registry ────────────────────────────────────────────────────
    let mut builder = TaskRegistry::builder();
    builder
        .register_source(&event_tasks)?
        .register_source(&email_tasks)?;
    let registry = Arc::new(builder.build());
    tracing::info!(tasks = ?registry.names(), "Task registry built");

    // ── Schedulers ───────────────────────────────────────────────────────
    let scheduler = Scheduler::new(Arc::clone(&queue), Arc::clone(&registry));
    let sources: [&dyn SchedulerSource; 2] = [&event_tasks, &email_tasks];
    scheduler.spawn_all(&Scheduler::discover(&sources)).await;

    // ── Lanes ────────────────────────────────────────────────────────────
    let lanes = LaneSet::start(
        &config.queues,
        Arc::clone(&store),
        registry,
        config.lane_poll_interval,
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    if config.http_port > 0 {
        let app = api_routes(Arc::clone(&router), Arc::clone(&store));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| format!("failed to bind HTTP port {}", config.http_port))?;
        eprintln!("   HTTP: http://0.0.0.0:{}", config.http_port);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("HTTP server stopped: {e}");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, waiting for lanes");
    lanes.shutdown().await;
    tracing::info!("Worker stopped");

    Ok(())
}
