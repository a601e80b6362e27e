// src/server/handlers/admin.rs
//! Admin statistics endpoint

use crate::server::{MetricsSnapshot, ServerState};
use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub open_transactions: usize,
    pub profiles: usize,
    pub upstream_permits_available: usize,
}

/// GET /v1/admin/stats
pub async fn stats(State(state): State<Arc<ServerState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        metrics: state.metrics.snapshot(),
        open_transactions: state.store().open_transactions(),
        profiles: state.resolver.profiles().len(),
        upstream_permits_available: state.provisioner.fetcher().available_permits(),
    })
}
