use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use moondream_service::{AppConfig, BackendLoader, ModelRegistry, build_router, select_device};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(?config.listen_addr, source = ?config.source, "loading model artifacts");
    if config.reload {
        tracing::info!("RELOAD set; restart-on-change is left to the process supervisor");
    }

    let profile = select_device();
    tracing::info!(device = %profile.kind, precision = ?profile.precision, "selected device");

    let registry = Arc::new(ModelRegistry::new(config.max_concurrent_invocations));
    registry
        .load(default_loader()?, config.source.clone(), profile)
        .await?;

    let router = build_router(config.clone(), registry.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown(config.shutdown_grace).await;
    tracing::info!("shutdown complete");

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn default_loader() -> anyhow::Result<Arc<dyn BackendLoader>> {
    Ok(Arc::new(moondream_service::model::tch_backend::TorchScriptLoader))
}

#[cfg(not(feature = "tch-backend"))]
fn default_loader() -> anyhow::Result<Arc<dyn BackendLoader>> {
    anyhow::bail!("no inference backend compiled in; rebuild with `--features tch-backend`")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
