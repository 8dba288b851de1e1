//! HTTP API module.
//!
//! Health, model listing and session management endpoints, plus the
//! channel upgrade route.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
