// src/server/handlers/ipxe.rs
//! iPXE script endpoints
//!
//! `/boot.ipxe` is static. `/ipxe` resolves the calling machine's profile,
//! provisions what it boots and renders the boot script. Resolution failures
//! never surface as HTTP errors: transient ones become a retry script with
//! backoff, terminal ones an error script that stops in the iPXE shell.

use super::ipxe_response;
use crate::profile::Machine;
use crate::server::ServerState;
use axum::extract::{Query, State};
use axum::http::Uri;
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn bootstrap(State(state): State<Arc<ServerState>>) -> Response {
    ipxe_response(state.scripts.bootstrap())
}

pub async fn boot_script(
    State(state): State<Arc<ServerState>>,
    query: Option<Query<Machine>>,
    uri: Uri,
) -> Response {
    let machine = query.map(|Query(machine)| machine).unwrap_or_default();
    let cancel = state.request_token();

    let script = match state.resolver.resolve(&machine, &cancel).await {
        Ok(resolution) => {
            for provisioned in &resolution.provisioned {
                state.metrics.record_provisioned(*provisioned);
            }
            state.metrics.record_boot_script();
            debug!(profile = %resolution.profile_id, "Serving boot script");
            state.scripts.boot(&resolution.config)
        }
        Err(e) => {
            state.metrics.record_failure(&e);
            if e.is_transient() {
                debug!(query = uri.query().unwrap_or(""), "Boot not ready, sending retry script: {}", e);
                state.metrics.record_retry_script();
                state.scripts.retry(uri.path(), uri.query(), &e.to_string())
            } else {
                warn!(query = uri.query().unwrap_or(""), "Boot failed permanently: {}", e);
                state.metrics.record_error_script();
                state.scripts.error(e.status_code(), &e.to_string())
            }
        }
    };

    ipxe_response(script)
}
