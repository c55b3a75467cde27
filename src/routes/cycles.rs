use actix_web::{web, HttpResponse, Responder};
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::models::HealthResponse;

/// Configure cycle and health routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/cycles", web::post().to(run_cycle));
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let healthy = match state.store.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Store health check failed: {}", e);
            false
        }
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    };

    if healthy {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

/// Run one matchmaking cycle over the configured profiles
///
/// POST /api/v1/cycles
///
/// Always answers 200 with the cycle report; a failed cycle is reported in
/// its `phase` and `error` fields.
async fn run_cycle(state: web::Data<AppState>) -> impl Responder {
    tracing::info!("Running cycle on demand over {} profiles", state.profiles.len());

    let report = state
        .backend
        .run_cycle(&state.profiles, &CancellationToken::new())
        .await;

    HttpResponse::Ok().json(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_response() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            timestamp: chrono::Utc::now(),
        };

        assert_eq!(response.status, "healthy");
    }
}
