use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use msme_risk_api::artifact;
use msme_risk_api::config::{Config, LogFormat};
use msme_risk_api::handlers::{self, AppState};
use msme_risk_api::health::Readiness;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes tracing. `LogFormat::Json` switches to structured output.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "msme_risk_api=info,tower_http=info".into());

    if format == LogFormat::Json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Main entry point for the service.
///
/// Binds the listener first so `/health` can report `starting` during warm
/// start, then loads the model artifact once. A failed load is terminal: the
/// readiness state flips to `failed` and the process exits non-zero.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first: it selects the log format
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!(
        "{} {} starting",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    config.log_summary();

    let readiness = Arc::new(Readiness::new());
    let app_state = Arc::new(AppState::new(config.clone(), readiness.clone()));
    let app = handlers::router(app_state)?;

    // Start server
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    });

    // Warm start: load the artifact off the async workers
    let model_path = config.model_path.clone();
    let pins = config.artifact_pins();
    tracing::info!("Loading model artifact from {}", model_path.display());
    let loaded = tokio::task::spawn_blocking(move || artifact::load_with(&model_path, &pins))
        .await
        .context("model loader task panicked")?;

    match loaded {
        Ok(handle) => {
            if !readiness.mark_ready(Arc::new(handle)) {
                anyhow::bail!("model handle was already initialized");
            }
            tracing::info!("Service ready");
        }
        Err(e) => {
            tracing::error!("Model artifact failed to load: {}", e);
            readiness.mark_failed(e.to_string());
            server.abort();
            return Err(anyhow::Error::new(e).context("refusing to serve without a valid model"));
        }
    }

    server.await.context("server task failed")??;
    tracing::info!("Server stopped");

    Ok(())
}
