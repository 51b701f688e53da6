use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

use emotion_server::candle_engine::CandleEmotionEngine;
use emotion_server::config::{Config, ModelConfig, UploadConfig};
use emotion_server::engine::EmotionEngine;
use emotion_server::lazy_engine::LazyEngine;
use emotion_server::{AppState, build_router};

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,emotion_server=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::info!("Starting emotion server with config: {:?}", config);

    let model_config = ModelConfig::from(&config);
    let upload_config = UploadConfig::from(&config);

    let engine = Arc::new(LazyEngine::new(move || {
        let model_config = model_config.clone();
        async move {
            let engine = CandleEmotionEngine::new(model_config).await?;
            Ok(Arc::new(engine) as Arc<dyn EmotionEngine>)
        }
    }));

    if config.eager_load {
        tracing::info!("Loading models...");
        engine.get().await?;
        tracing::info!("Models loaded successfully");
    } else {
        tracing::info!("Models will be loaded on the first request");
    }

    let mut app = build_router(AppState::new(engine, upload_config.clone()));

    if !config.disable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        app = app
            .route("/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());
    tracing::info!(
        "Max upload: {} bytes, classification timeout: {:?}",
        upload_config.max_upload_bytes,
        upload_config.classify_timeout
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
