//! Agent Execution Substrate - multi-tenant conversational agent host.
//!
//! A Rust backend hosting per-user Sessions, Sub-Agent Tasks, Schedules,
//! a Memory Store, and an Event Bus behind one axum server.

mod api;
mod chat_adapter;
mod config;
mod error;
mod event_bus;
mod file_tracker;
mod ids;
mod llm;
mod memory;
mod persist;
mod quota;
mod scheduler;
mod session;
mod task_manager;
mod users;

use api::{create_router, AgentHost};
use config::Config;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_host=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    tracing::info!(path = %config.persistence_root.display(), "preparing persistence root");
    let host = AgentHost::new(config.clone()).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(host.clone())
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let tick_host = host.clone();
    let tick_period = std::cmp::min(
        config.scheduler_tick(),
        config.event_bus_ping_interval(),
    )
    .max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_period);
        loop {
            interval.tick().await;
            tick_host.periodic_tick().await;
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    tracing::info!("agent host listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(host.clone()))
        .await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM, then drain in-flight sub-agent work before
/// the server stops accepting connections.
async fn shutdown_signal(host: AgentHost) {
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
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight tasks");
    host.drain().await;
}
