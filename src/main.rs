use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use tablewise::config::Config;
use tablewise::outbox::LogSink;
use tablewise::registry::Registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = Arc::new(Config::load(config_path.as_deref())?);

    tablewise::observability::init_tracing(&config.log.filter, config.log.json);
    tablewise::observability::init_metrics(config.server.metrics_port)?;

    let registry = Arc::new(Registry::from_config(config.clone(), Arc::new(LogSink))?);
    registry.start_maintainers();

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!("tablewise listening on {}", config.server.bind);
    info!("  data_dir: {}", config.server.data_dir.display());
    info!("  restaurants: {}", registry.venues().len());
    info!("  auto_assign: {}", config.features.auto_assign);
    info!(
        "  metrics: {}",
        config
            .server
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let app = tablewise::http::router(registry.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Maintainers finish the pass they are in, then stop.
    registry.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("tablewise stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
