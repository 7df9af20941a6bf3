//! Router, middleware stack and server lifecycle.
//!
//! Outermost first: request id, tracing, timeout. The webhook route adds its
//! own body size cap. The `/mail` routes skip the request timeout.
//!
//! [`start_server`] stops accepting connections once its shutdown token is
//! cancelled and drains in-flight requests. [`shutdown_signal`] resolves on
//! CTRL+C or SIGTERM so the binary can cancel that token.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{handlers, AppState};

/// Request ID header set on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Router limits.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Largest accepted webhook body.
    pub max_body_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), max_body_bytes: 1024 * 1024 }
    }
}

/// Health, metrics, webhook and mail routes behind the shared middleware.
///
/// # Example
///
/// ```no_run
/// use postline_api::{server::ServerOptions, AppState};
///
/// fn router(state: AppState) -> axum::Router {
///     postline_api::create_router(state, ServerOptions::default())
/// }
/// ```
pub fn create_router(state: AppState, options: ServerOptions) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        .route("/metrics/webhooks", get(handlers::webhook_metrics));

    let webhook_routes = Router::new()
        .route("/webhooks/provider", post(handlers::receive_webhook))
        .layer(DefaultBodyLimit::max(options.max_body_bytes));

    // Provider calls are bounded by their retry budget, not the request timeout.
    let mail_routes = Router::new()
        .route("/mail/address-verifications", post(handlers::verify_address))
        .route("/mail/costs", post(handlers::calculate_cost))
        .route("/mail/letters", post(handlers::create_letter))
        .route("/mail/letters/{id}", get(handlers::get_letter));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .layer(TimeoutLayer::new(options.request_timeout))
        .merge(mail_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Stamps every response with a request id, reusing the caller's if sent.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Serves the router until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or the server
/// fails while running.
pub async fn start_server(
    state: AppState,
    options: ServerOptions,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state, options);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            warn!("Draining in-flight requests before exit");
        })
        .await?;

    info!("Server drained");
    Ok(())
}

/// Resolves on the first of SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "SIGINT handler unavailable");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!(signal = "SIGINT", "Shutting down");
        },
        () = terminate => {
            info!(signal = "SIGTERM", "Shutting down");
        },
    }
}
