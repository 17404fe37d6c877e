//! Server assembly and startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{AppState, api_router};
use crate::broker::EventBroker;
use crate::pipeline::{GenerationPipeline, PipelineConfig};
use crate::providers::{DelimiterValidator, Generator, OpenAiGenerator};
use crate::store::{JobStore, MemoryJobStore};
use crate::transport::TransportConfig;

/// Configuration for the generation service.
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
    pub model_base_url: String,
    pub model_api_key: String,
    pub model: String,
    /// Hard cap on stream connection lifetime, in seconds.
    pub stream_lifetime_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4317,
            dev_mode: false,
            model_base_url: "https://api.openai.com/v1".to_string(),
            model_api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            stream_lifetime_secs: 30,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api_router().with_state(state)
}

/// Start the generation service.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(EventBroker::new());
    let generator = Arc::new(OpenAiGenerator::new(
        config.model_base_url.clone(),
        config.model_api_key.clone(),
        config.model.clone(),
    ));
    let pipeline = Arc::new(GenerationPipeline::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        // One adapter fills both generator seats; the cast unsizes the
        // borrowed clone, which does not coerce on its own.
        Arc::clone(&generator) as Arc<dyn Generator>,
        generator,
        Arc::new(DelimiterValidator),
        None,
        PipelineConfig::default(),
    ));

    let state = Arc::new(AppState {
        store,
        broker,
        pipeline,
        transport: TransportConfig {
            max_lifetime: Duration::from_secs(config.stream_lifetime_secs),
            ..TransportConfig::default()
        },
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("Lesson generation service listening at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down");
}
