// Model exports
pub mod domain;
pub mod requests;
pub mod responses;

pub use domain::{
    Assignment, Backfill, BackfillRecord, DoubleRangeFilter, Match, MatchProfile, Pool,
    RangeExclusion, SearchFields, StringEqualsFilter, TagPresentFilter, Ticket,
};
pub use requests::{CreateBackfillRequest, CreateTicketRequest};
pub use responses::{DeleteResponse, ErrorResponse, HealthResponse};
