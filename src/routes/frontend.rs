use actix_web::{web, HttpResponse, Responder};
use validator::Validate;

use super::{store_error_response, AppState};
use crate::models::{
    Backfill, CreateBackfillRequest, CreateTicketRequest, DeleteResponse, ErrorResponse, Ticket,
};

/// Configure ticket and backfill routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/tickets", web::post().to(create_ticket))
        .route("/tickets/{id}", web::get().to(get_ticket))
        .route("/tickets/{id}", web::delete().to(delete_ticket))
        .route("/backfills", web::post().to(create_backfill))
        .route("/backfills/{id}", web::get().to(get_backfill))
        .route("/backfills/{id}", web::delete().to(delete_backfill));
}

fn validation_failed(errors: validator::ValidationErrors) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: "Validation failed".to_string(),
        message: errors.to_string(),
        status_code: 400,
    })
}

/// Create ticket endpoint
///
/// POST /api/v1/tickets
///
/// Request body:
/// ```json
/// {
///   "searchFields": { "doubleArgs": {"mmr": 1500}, "stringArgs": {"region": "eu"}, "tags": ["ranked"] },
///   "extensions": {}
/// }
/// ```
async fn create_ticket(
    state: web::Data<AppState>,
    req: web::Json<CreateTicketRequest>,
) -> impl Responder {
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    let req = req.into_inner();
    let mut ticket = Ticket::new(req.search_fields);
    ticket.extensions = req.extensions;

    match state.store.create_ticket(ticket).await {
        Ok(ticket) => {
            tracing::debug!("Created ticket {}", ticket.id);
            HttpResponse::Created().json(ticket)
        }
        Err(e) => {
            tracing::error!("Failed to create ticket: {}", e);
            store_error_response(&e)
        }
    }
}

async fn get_ticket(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.store.get_ticket(&path).await {
        Ok(ticket) => HttpResponse::Ok().json(ticket),
        Err(e) => store_error_response(&e),
    }
}

async fn delete_ticket(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match state.store.delete_ticket(&id).await {
        Ok(()) => HttpResponse::Ok().json(DeleteResponse { success: true, id }),
        Err(e) => store_error_response(&e),
    }
}

/// Create backfill endpoint
///
/// POST /api/v1/backfills
///
/// `ticketIds` are associated with the backfill until it is acknowledged.
async fn create_backfill(
    state: web::Data<AppState>,
    req: web::Json<CreateBackfillRequest>,
) -> impl Responder {
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    let req = req.into_inner();
    let mut backfill = Backfill::new(req.search_fields);
    backfill.extensions = req.extensions;

    match state.store.create_backfill(backfill, req.ticket_ids, None).await {
        Ok(backfill) => {
            tracing::debug!("Created backfill {}", backfill.id);
            HttpResponse::Created().json(backfill)
        }
        Err(e) => {
            tracing::error!("Failed to create backfill: {}", e);
            store_error_response(&e)
        }
    }
}

async fn get_backfill(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.store.get_backfill(&path).await {
        Ok(record) => HttpResponse::Ok().json(record),
        Err(e) => store_error_response(&e),
    }
}

async fn delete_backfill(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match state.store.delete_backfill(&id).await {
        Ok(()) => HttpResponse::Ok().json(DeleteResponse { success: true, id }),
        Err(e) => store_error_response(&e),
    }
}
