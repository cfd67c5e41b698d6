//! HTTP surface of the Coordinator
//!
//! Two routers: the client-facing REST surface (status, manifest, update,
//! recover, secrets) and the marble-facing surface (activate, quote).
//! Transport security is the deployment's concern; the core exposes the
//! root and intermediate material needed to certify the listeners.

pub mod error;
pub mod handlers;
pub mod marble;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use handlers::{AppState, CLIENT_CERT_HEADER};

/// The client-facing REST router
pub fn create_client_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route(
            "/manifest",
            get(handlers::get_manifest).post(handlers::post_manifest),
        )
        .route("/update", post(handlers::post_update))
        .route("/recover", post(handlers::post_recover))
        .route(
            "/secrets/{name}",
            get(handlers::get_secret).post(handlers::post_secret),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The marble-facing router served on the mesh address
pub fn create_marble_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/activate", post(marble::activate))
        .route("/quote", get(marble::quote))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
