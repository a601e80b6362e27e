// src/server/handlers/ignition.rs
//! Ignition config for the calling machine's profile

use super::error_response;
use crate::profile::Machine;
use crate::server::ServerState;
use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use std::sync::Arc;

/// GET /ignition
///
/// Inline configs are returned as JSON, external ones are a redirect.
pub async fn get_ignition(
    State(state): State<Arc<ServerState>>,
    query: Option<Query<Machine>>,
) -> Response {
    let machine = query.map(|Query(machine)| machine).unwrap_or_default();

    let profile = match state.resolver.profiles().select(&machine) {
        Ok(profile) => profile,
        Err(e) => return error_response(&e),
    };

    if let Some(inline) = &profile.ignition.inline {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            inline.clone(),
        )
            .into_response();
    }
    if let Some(source) = &profile.ignition.source {
        return Redirect::temporary(source).into_response();
    }

    (
        StatusCode::NOT_FOUND,
        format!("profile {} has no ignition config", profile.id),
    )
        .into_response()
}
