use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod cron;
mod error;
mod http;
mod id;
mod notification;
mod notifier;
mod registry;
mod snapshot;
mod task;
mod tasks;

use config::AppConfig;
use notification::NotificationService;
use notifier::telegram::TelegramChannel;
use notifier::{NotifierChannel, NotifierId};
use registry::TaskRegistry;
use snapshot::SnapshotStore;

const APP_NAME: &str = "notify-server";
const SNAPSHOT_DIR: &str = "data";
const NOTIFIER_QUEUE_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = APP_NAME, about = "Job-execution engine and notifier dispatcher")]
struct Cli {
    /// Path to the JSON configuration file. Falls back to
    /// NOTIFY_SERVER_CONFIG, then ./notify-server.json.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notify_server_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = ?e, "fatal error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).await?;

    tracing::info!("starting notify-server-core");

    let store = Arc::new(SnapshotStore::new(SNAPSHOT_DIR, APP_NAME).await?);

    let mut registry = TaskRegistry::new();
    for entry in tasks::builtin_entries(&config.tasks)? {
        registry.register(entry);
    }
    let registry = Arc::new(registry);

    let mut channels: Vec<Arc<dyn NotifierChannel>> = Vec::new();
    for tg in &config.notifier.telegrams {
        channels.push(Arc::new(TelegramChannel::new(
            NotifierId::new(tg.id.clone())?,
            &tg.bot_token,
            tg.chat_id,
            NOTIFIER_QUEUE_CAPACITY,
        )));
    }
    let sender = Arc::new(NotificationService::new(
        channels,
        NotifierId::new(config.notifier.default_notifier_id.clone())?,
    )?);

    let stop = CancellationToken::new();

    let notifier_handles = sender.start(stop.clone());
    let (task_service_join, task_service_handle) =
        task::service::start(registry, store, sender.clone(), stop.clone());

    let cron_scheduler = cron::CronScheduler::from_config(&config.tasks, &sender).await;
    let cron_handles = cron_scheduler.start(task_service_handle.clone(), sender.clone(), stop.clone());

    let applications: HashMap<String, config::ApplicationConfig> = config
        .notify_api
        .applications
        .iter()
        .map(|app| (app.app_key.clone(), app.clone()))
        .collect();

    if config.notify_api.ws.tls_server {
        tracing::warn!(
            "notify_api.ws.tls_server is set but this build serves plain HTTP only; ignoring"
        );
    }

    let state = http::AppState {
        task_service: task_service_handle,
        sender: sender.clone(),
        applications: Arc::new(applications),
        started_at: Instant::now(),
    };

    let app = http::router(state, &config.notify_api.cors.allow_origins);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.notify_api.ws.listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let server_stop = stop.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_stop.cancelled().await;
    });
    let server_task = tokio::spawn(server);

    shutdown_signal().await;
    stop.cancel();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "http server error"),
        Err(e) => tracing::error!(error = %e, "http server task panicked"),
    }

    for handle in cron_handles {
        handle.abort();
    }

    let shutdown_deadline = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_deadline, task_service_join)
        .await
        .is_err()
    {
        tracing::error!("task service did not shut down within the deadline");
        std::process::exit(1);
    }

    sender.join_with_deadline(notifier_handles).await;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
