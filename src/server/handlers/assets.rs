// src/server/handlers/assets.rs
//! iPXE boot-loader binaries (`boot_<arch>.efi`)
//!
//! Served under `/boot/` and at the root, where DHCP `filename` options
//! usually point.

use crate::arch::normalize_arch;
use crate::server::ServerState;
use crate::upstream::is_valid_arch;
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;

/// GET /boot/:file
pub async fn boot_binary(
    State(state): State<Arc<ServerState>>,
    Path(file): Path<String>,
    request: Request,
) -> Response {
    serve_binary(&state, &file, request).await
}

/// Fallback for unrouted paths: `/boot_<arch>.efi`, anything else is 404
pub async fn root_boot_binary(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let file = request.uri().path().trim_start_matches('/').to_string();
    if file.contains('/') {
        return StatusCode::NOT_FOUND.into_response();
    }
    serve_binary(&state, &file, request).await
}

async fn serve_binary(state: &ServerState, file: &str, request: Request) -> Response {
    match binary_path(state, file) {
        Some(path) => match ServeFile::new(path).oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `boot_<arch>.efi` in the assets directory, arch normalized
fn binary_path(state: &ServerState, file: &str) -> Option<PathBuf> {
    let raw = file.strip_prefix("boot_")?.strip_suffix(".efi")?;
    let arch = normalize_arch(raw);
    if !is_valid_arch(arch) {
        return None;
    }
    Some(state.config.assets_dir.join(format!("boot_{}.efi", arch)))
}
