//! HTTP surface of the agent.
//!
//! [`build_router`] is shared by the binary and the integration tests so both
//! exercise the same middleware stack.

mod error;
mod routes;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{http::StatusCode, Router};
use edgecam_orchestrator::CommandDispatcher;
use edgecam_types::{config::ServerConfig, EdgecamError, Result};
use tokio::net::TcpListener;
use tower_http::{
    services::ServeDir,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

pub use error::{AppError, AppResult};
pub use routes::GREETING;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub dispatcher: Arc<CommandDispatcher>,
}

impl AppContext {
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { dispatcher }
    }
}

pub fn build_router(ctx: AppContext, config: &ServerConfig) -> Router {
    Router::new()
        .merge(routes::router())
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(ctx)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(router: Router, config: &ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
        .parse()
        .map_err(|err| {
            EdgecamError::Configuration(format!(
                "invalid bind address {}:{}: {err}",
                config.bind_addr, config.port
            ))
        })?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| EdgecamError::Network(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| EdgecamError::Network(format!("HTTP server error: {err}")))?;
    info!("HTTP server stopped");
    Ok(())
}
