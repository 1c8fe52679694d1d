mod config;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::routes::{self, GatewayState};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let state = GatewayState {
        dispatcher: Dispatcher::new(),
        config: config.connection.clone(),
    };

    let app = Router::new()
        .merge(routes::router(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley hub listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
