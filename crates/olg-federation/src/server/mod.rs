//! HTTP surface: the peer-facing federation API, health, and the bearer
//! authenticated admin API under `/admin`.

mod admin_api;
mod bearer;
mod error;
mod federation_api;

pub use bearer::Caller;
pub use error::{ApiError, status_for};

use std::net::SocketAddr;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::service::FederationService;

/// Build the full router over a service.
pub fn router(service: FederationService) -> Router {
    let body_limit = service.config.inbound.max_payload_bytes;
    Router::new()
        .merge(federation_api::routes())
        .nest("/admin", admin_api::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    service: FederationService,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Federation API listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Client address as reported by the fronting proxy, recorded as audit origin.
fn origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
