// src/server/handlers/mod.rs
//! HTTP request handlers for netbootd

pub mod admin;
pub mod artifacts;
pub mod assets;
pub mod ignition;
pub mod ipxe;

use crate::error::Error;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Scripts are always 200: firmware only executes successful responses
pub(crate) fn ipxe_response(script: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        script.into(),
    )
        .into_response()
}

/// Plain-text error with the error's status code
pub(crate) fn error_response(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.to_string()).into_response()
}
