//! Liveness endpoint

use std::net::{Ipv6Addr, SocketAddr};

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Body returned by every health route
pub const HEALTHY: &str = "OK!";

/// Build the health router
///
/// `/healthz` and any other path answer 200 with a fixed body.
pub fn health_routes() -> Router {
    Router::new()
        .route("/healthz", get(|| async { HEALTHY }))
        .fallback(|| async { HEALTHY })
}

/// Serve the health router on `port` until `cancel` fires
///
/// Bind and accept errors are returned; the caller treats them as fatal.
pub async fn serve(port: u16, cancel: CancellationToken) -> std::io::Result<()> {
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health check server started");
    axum::serve(listener, health_routes())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
