// Route exports
pub mod cycles;
pub mod frontend;

use actix_web::{error, http::StatusCode, web, HttpRequest, HttpResponse};
use serde::Serialize;
use std::sync::Arc;

use crate::core::Backend;
use crate::models::{ErrorResponse, MatchProfile};
use crate::statestore::{StateStore, StoreError};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub backend: Backend,
    pub profiles: Arc<Vec<MatchProfile>>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .configure(frontend::configure)
            .configure(cycles::configure),
    );
}

/// JSON error response for malformed payloads
#[derive(Debug, Serialize)]
pub struct JsonError {
    pub error: String,
    pub message: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for JsonError {}

impl error::ResponseError for JsonError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST))
            .json(self)
    }
}

/// Handle JSON payload errors
pub fn handle_json_payload_error(err: error::JsonPayloadError, req: &HttpRequest) -> actix_web::Error {
    tracing::info!("JSON payload error on {}: {}", req.path(), err);
    JsonError {
        error: "invalid_json".to_string(),
        message: format!("Invalid JSON: {}", err),
        status_code: 400,
    }
    .into()
}

/// Handle path parameter errors
pub fn handle_path_error(err: error::PathError, _req: &HttpRequest) -> actix_web::Error {
    JsonError {
        error: "invalid_path".to_string(),
        message: format!("Invalid path: {}", err),
        status_code: 400,
    }
    .into()
}

/// Map a store failure onto an HTTP error body
pub(crate) fn store_error_response(err: &StoreError) -> HttpResponse {
    let (status, error) = match err {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
        StoreError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
        StoreError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
    };

    HttpResponse::build(status).json(ErrorResponse {
        error: error.to_string(),
        message: err.to_string(),
        status_code: status.as_u16(),
    })
}
