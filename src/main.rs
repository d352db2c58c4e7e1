mod batched_engine;
mod config;
mod engine;
mod error;
mod labels;
mod nli_engine;
mod reflection;
mod server;
mod types;
mod zero_shot;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use batched_engine::BatchedEngineWrapper;
use config::{BatchConfig, Config};
use nli_engine::{NliConfig, NliZeroShotEngine};
use server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);

    tracing::info!("Starting MoodScape server with config: {:?}", config);
    config.validate()?;

    let batch_config = BatchConfig::from(&config);

    let nli_config = NliConfig {
        model_id: config.model_id.clone(),
        model_path: config.model_path.clone(),
        revision: config.model_revision.clone(),
        use_pth: config.use_pth,
        cpu: config.cpu_only,
        max_sequence_length: config.max_sequence_length,
        id2label: config.parse_id2label(),
        hypothesis_template: config.hypothesis_template.clone(),
    };

    tracing::info!("Loading zero-shot NLI model...");
    let nli_engine = NliZeroShotEngine::new(nli_config).await?;
    tracing::info!("Model loaded successfully");

    let (engine, processor) = BatchedEngineWrapper::new(batch_config.clone(), nli_engine);

    tokio::spawn(async move {
        tracing::info!("Starting batch processor");
        if let Err(e) = processor.run_forever().await {
            tracing::error!("Batch processor error: {}", e);
        }
    });

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = server::router(AppState::new(Arc::new(engine)))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(server::cors_layer(&config.cors_origins)?)
                .layer(prometheus_layer),
        );

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());
    tracing::info!(
        "Max batch pairs: {}, Tick duration: {:?}",
        batch_config.max_batch_pairs,
        batch_config.tick_duration
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,moodscape=debug".into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received, draining connections");
}
