//! Axum surface over the ledger components.

mod account;
mod errors;
mod payments;
mod state;
mod tasks;

pub use errors::{ApiError, ErrorDetail, ErrorResponse, map_credit_error};
pub use state::{AppState, VISITOR_COOKIE, VISITOR_HEADER, router};
