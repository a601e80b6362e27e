// src/server/routes.rs
//! Axum router configuration for netbootd

use crate::server::ServerState;
use crate::server::handlers::{admin, artifacts, assets, ignition, ipxe};
use axum::{Router, routing::get};
use std::sync::Arc;

/// Create the main application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Firmware entry point and per-machine scripts
        .route("/boot.ipxe", get(ipxe::bootstrap))
        .route("/ipxe", get(ipxe::boot_script))
        // Cached, verified upstream artifacts
        .route(
            "/flatcar/:channel/:arch/:version/:artifact",
            get(artifacts::get_artifact),
        )
        // iPXE boot-loader binaries
        .route("/boot/:file", get(assets::boot_binary))
        .route("/ignition", get(ignition::get_ignition))
        .route("/health", get(health_check))
        .route("/v1/admin/stats", get(admin::stats))
        .fallback(assets::root_boot_binary)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
