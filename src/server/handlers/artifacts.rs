// src/server/handlers/artifacts.rs
//! Flatcar artifact endpoint
//!
//! Serves a kernel or initrd out of the store, fetching and verifying it
//! first when missing. Bytes are only streamed after commit, so a client can
//! never receive unverified data.

use super::error_response;
use crate::error::{Error, Result};
use crate::server::ServerState;
use crate::upstream::{Artifact, CURRENT_VERSION};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct ArtifactPath {
    pub channel: String,
    pub arch: String,
    pub version: String,
    pub artifact: String,
}

/// GET /flatcar/:channel/:arch/:version/:artifact
pub async fn get_artifact(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<ArtifactPath>,
) -> Response {
    match serve_artifact(&state, &path).await {
        Ok(response) => response,
        Err(e) => {
            state.metrics.record_failure(&e);
            failure_response(&state, &path, &e)
        }
    }
}

async fn serve_artifact(state: &ServerState, path: &ArtifactPath) -> Result<Response> {
    let artifact: Artifact = path.artifact.parse()?;
    let cancel = state.request_token();

    let key = state
        .provisioner
        .resolve_key(&path.channel, &path.arch, &path.version, &cancel)
        .await?;
    let (provisioned, file) = state.provisioner.open(&key, artifact, &cancel).await?;

    state.metrics.record_provisioned(provisioned);
    state.metrics.record_bytes_served(provisioned.size());

    // "current" moves; concrete releases never change
    let cache_control = if path.version == CURRENT_VERSION {
        "no-cache"
    } else {
        "public, max-age=31536000, immutable"
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, provisioned.size())
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| Error::IoError(format!("Failed to build response: {e}")))
}

fn failure_response(state: &ServerState, path: &ArtifactPath, error: &Error) -> Response {
    if let Error::ConflictError(_) = error {
        let retry_after = (state.scripts.backoff().target_ms(0) / 1000).max(1);
        return (
            StatusCode::CONFLICT,
            [(header::RETRY_AFTER, retry_after.to_string())],
            error.to_string(),
        )
            .into_response();
    }

    if !error.is_integrity() {
        warn!(
            "Failed to serve {}/{}/{}/{}: {}",
            path.channel, path.arch, path.version, path.artifact, error
        );
    }
    error_response(error)
}
