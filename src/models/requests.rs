use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;
use crate::models::domain::SearchFields;

/// Request to create a ticket
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateTicketRequest {
    #[serde(alias = "search_fields", rename = "searchFields", default)]
    pub search_fields: SearchFields,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Request to create a backfill, optionally with tickets already associated
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateBackfillRequest {
    #[serde(alias = "search_fields", rename = "searchFields", default)]
    pub search_fields: SearchFields,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
    #[validate(custom(function = "validate_ticket_ids"))]
    #[serde(alias = "ticket_ids", rename = "ticketIds", default)]
    pub ticket_ids: Vec<String>,
}

fn validate_ticket_ids(ids: &[String]) -> Result<(), validator::ValidationError> {
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(validator::ValidationError::new("empty_ticket_id"));
    }
    Ok(())
}
