//! Confab - chat service with durable conversation history
//!
//! Keeps every conversation in a local SQLite database, streams model replies
//! to the client as they arrive, and supports full backup and restore.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;

use config::Config;
use core::{RecordStore, SessionController};
use providers::Provider;
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let store = RecordStore::new(&config.database_path()).await?;
    let provider = Provider::from_config(&config)?;
    tracing::info!(model = provider.model_name(), "model provider ready");

    let controller = Arc::new(SessionController::new(
        store,
        Arc::new(provider),
        config.service.history.preview_chars,
    ));

    // Settle the first selection before serving
    let listing = controller.list().await?;
    tracing::info!(
        conversations = listing.conversations.len(),
        current = ?listing.current,
        "history loaded"
    );

    let state = AppState {
        config: Arc::new(config),
        controller,
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Confab API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
