//! HTTP API module.
//!
//! Session management endpoints, the control WebSocket and the fallback that
//! routes app traffic to session containers.

mod control;
mod error;
pub mod handlers;
mod routes;
mod state;

pub use control::{ControlCommand, ControlEvent};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::{AppState, CurrentUser, DEFAULT_IDENTITY_HEADER};
