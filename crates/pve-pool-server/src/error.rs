use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pve_pool_common::PoolError;
use serde_json::json;
use thiserror::Error;

/// Wraps [`PoolError`] for the HTTP boundary. Unrecoverable pool/PVE
/// failures become 500s; the pool layer already downgrades everything that
/// should not fail the request (hostname rename, unknown vmid on
/// release/remove) to a warning before it ever reaches a handler.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Pool(err) = self;
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response()
    }
}
