//! Application state shared across handlers.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::session::{SessionRegistry, UserIdentity};

use super::error::ApiError;

/// Header carrying the caller's user id when none is configured.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Trusted header set by the fronting layer that authenticated the caller.
    pub identity_header: Arc<str>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            identity_header: Arc::from(DEFAULT_IDENTITY_HEADER),
        }
    }

    pub fn with_identity_header(mut self, header: impl Into<String>) -> Self {
        self.identity_header = Arc::from(header.into().to_ascii_lowercase());
        self
    }
}

/// The caller, as identified by the trusted identity header.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserIdentity);

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(state.identity_header.as_ref())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ApiError::unauthorized(format!("missing {} header", state.identity_header))
            })?;

        Ok(CurrentUser(UserIdentity::new(id)))
    }
}
