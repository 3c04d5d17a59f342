use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use editbot_comfyui::client::ComfyUIClient;
use editbot_comfyui::launcher::Launcher;
use editbot_comfyui::workflow::WorkflowBuilder;
use editbot_worker::config::WorkerConfig;
use editbot_worker::intake::{self, IntakeState};
use editbot_worker::processor::Processor;
use editbot_worker::queue::{HistoryPruner, JobQueue};
use editbot_worker::sink::{DeliverySink, LogSink, WebhookSink};

/// How often terminal jobs older than the configured age are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Time the pruning task gets to exit after cancellation.
const PRUNE_STOP_GRACE: Duration = Duration::from_secs(5);

/// Time the launched ComfyUI gets to exit after SIGTERM.
const LAUNCHER_STOP_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "editbot_worker=debug,editbot_comfyui=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        comfyui = %format!("{}:{}", config.comfyui_host, config.comfyui_port),
        "Loaded worker configuration",
    );

    // Cancelled by SIGINT/SIGTERM, or by the processor on a fatal queue error.
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    // --- ComfyUI ---
    let mut launcher = match config.launcher() {
        Some(launcher_config) => {
            let mut launcher = Launcher::new(launcher_config);
            launcher.start().context("Failed to launch ComfyUI")?;
            Some(launcher)
        }
        None => None,
    };

    let client = ComfyUIClient::from_host(&config.comfyui_host, config.comfyui_port)
        .with_tracker_config(config.tracker());

    let readiness = config.readiness();
    if !client.wait_ready(&readiness, &shutdown).await {
        stop_launcher(&mut launcher).await;
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested before ComfyUI became ready");
            return Ok(());
        }
        anyhow::bail!(
            "ComfyUI did not become ready within {} attempts ({}s)",
            readiness.max_attempts,
            readiness.budget().as_secs()
        );
    }

    // --- Workflow template ---
    let workflows =
        match WorkflowBuilder::from_files(&config.workflow_template, config.workflow_ui.as_deref())
            .map(|builder| builder.with_node_map(config.node_map()))
            .and_then(|builder| builder.validate_template().map(|()| builder))
        {
            Ok(builder) => builder,
            Err(e) => {
                stop_launcher(&mut launcher).await;
                return Err(e).context("Failed to load workflow template");
            }
        };

    // --- Queue, sink, processor ---
    let queue = Arc::new(JobQueue::new(config.queue()));

    let sink: Arc<dyn DeliverySink> = match &config.delivery_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering results to webhook");
            Arc::new(WebhookSink::new(url.clone()).context("Failed to build webhook client")?)
        }
        None => {
            tracing::info!("No webhook configured, results are only logged");
            Arc::new(LogSink)
        }
    };

    let processor = Processor::new(
        Arc::clone(&queue),
        Arc::new(client),
        Arc::new(workflows),
        sink,
        config.processor(),
    )
    .spawn(shutdown.clone());

    // --- History pruning ---
    let pruner = HistoryPruner::spawn(Arc::clone(&queue), config.history_max_age, PRUNE_INTERVAL);

    // --- Intake ---
    let state = IntakeState {
        queue: Arc::clone(&queue),
        defaults: Arc::new(config.defaults.clone()),
        limits: Arc::new(config.limits.clone()),
    };
    let app = intake::router(state, Duration::from_secs(config.request_timeout_secs));

    let addr = SocketAddr::new(
        config.host.parse().context("Invalid HOST address")?,
        config.port,
    );
    tracing::info!(%addr, "Starting intake server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind intake address")?;

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;

    // --- Post-shutdown cleanup ---
    tracing::info!("Intake stopped, cleaning up");
    shutdown.cancel();

    let processed = processor.shutdown(config.shutdown_grace()).await;
    tracing::info!("Processor shut down");

    pruner.stop(PRUNE_STOP_GRACE).await;

    stop_launcher(&mut launcher).await;

    served.context("Intake server error")?;
    processed.context("Processor stopped on a queue error")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn stop_launcher(launcher: &mut Option<Launcher>) {
    if let Some(launcher) = launcher.as_mut() {
        launcher.stop(LAUNCHER_STOP_GRACE).await;
    }
}

/// Cancel `shutdown` on SIGINT (Ctrl-C) or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
        () = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
