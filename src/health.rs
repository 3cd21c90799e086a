//! Liveness and readiness endpoints for the controller pod
//!
//! `/healthz` answers as soon as the process is up. `/readyz` returns 503
//! until [`Readiness::mark_ready`] is called, which happens once CRDs are in
//! place and (with leader election on) the Lease is held.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::Error;

/// Shared readiness flag
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Report ready from now on
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Report not ready, e.g. after losing leadership
    pub fn mark_not_ready(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Current state
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Probe routes
pub fn router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

/// Serve probes on `addr` until the process exits
pub async fn serve(addr: SocketAddr, readiness: Readiness) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal("health", format!("bind {addr}: {e}")))?;
    info!(%addr, "Serving health probes");
    axum::serve(listener, router(readiness))
        .await
        .map_err(|e| Error::internal("health", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn(readiness: Readiness) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(readiness)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn story_readiness_follows_startup() {
        let readiness = Readiness::default();
        let base = spawn(readiness.clone()).await;
        let client = reqwest::Client::new();

        let live = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(live.status(), reqwest::StatusCode::OK);

        let ready = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_ready();
        let ready = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);

        readiness.mark_not_ready();
        let ready = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }
}
