//! Per-request failures and the funnel that carries them to the terminal stage.
//!
//! Handlers and gates never write an error body themselves. Returning a
//! [`RequestError`] produces a placeholder response tagged with
//! [`Funneled::Error`]; the terminal stage of each service is the only place
//! that turns the tag into the final status and `{"error": ...}` body.

use std::fmt;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::route::Operation;

/// Message shown to callers when the failure carries no safe message.
pub const GENERIC_ERROR_MESSAGE: &str = "An internal server error has occurred. Please try again.";

/// A request-scoped failure.
///
/// `status` defaults to 500. `safe_message` is the only text ever shown to the
/// caller; `source` is logged and never leaves the process.
#[derive(thiserror::Error)]
#[error("{source}")]
pub struct RequestError {
    status: StatusCode,
    safe_message: Option<String>,
    #[source]
    source: anyhow::Error,
}

impl RequestError {
    /// Internal failure: 500 with the generic message.
    pub fn new(source: impl Into<anyhow::Error>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            safe_message: None,
            source: source.into(),
        }
    }

    /// Business failure whose message is safe to show.
    pub fn safe(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            source: anyhow::anyhow!(message.clone()),
            safe_message: Some(message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::safe(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(source: impl Into<anyhow::Error>) -> Self {
        Self::new(source)
            .with_status(StatusCode::UNAUTHORIZED)
            .with_safe_message("Unauthorized.")
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(anyhow::anyhow!("request did not complete within {after:?}"))
            .with_status(StatusCode::GATEWAY_TIMEOUT)
            .with_safe_message("The request timed out. Please try again.")
    }

    pub fn not_supported(component: &str, op: &Operation) -> Self {
        Self::new(anyhow::anyhow!(
            "component '{component}' does not implement '{op}'"
        ))
        .with_status(StatusCode::NOT_IMPLEMENTED)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_safe_message(mut self, message: impl Into<String>) -> Self {
        self.safe_message = Some(message.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn safe_message(&self) -> Option<&str> {
        self.safe_message.as_deref()
    }

    /// The text the terminal stage puts under `"error"`.
    pub fn public_message(&self) -> &str {
        self.safe_message.as_deref().unwrap_or(GENERIC_ERROR_MESSAGE)
    }
}

impl fmt::Debug for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestError")
            .field("status", &self.status)
            .field("safe_message", &self.safe_message)
            .field("source", &format_args!("{:#}", self.source))
            .finish()
    }
}

impl From<anyhow::Error> for RequestError {
    fn from(source: anyhow::Error) -> Self {
        Self::new(source)
    }
}

/// Outcome recorded on a response for the terminal stage to render.
#[derive(Clone, Debug)]
pub enum Funneled {
    Error(Arc<RequestError>),
    /// Nothing mounted answered the request.
    Unmatched,
}

impl Funneled {
    /// Placeholder response carrying `self`. Its status and body are replaced
    /// by the terminal stage.
    pub fn into_placeholder(self) -> Response {
        let status = match &self {
            Funneled::Error(e) => e.status(),
            Funneled::Unmatched => StatusCode::NOT_FOUND,
        };
        let mut res = status.into_response();
        res.extensions_mut().insert(self);
        res
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        Funneled::Error(Arc::new(self)).into_placeholder()
    }
}

/// Router fallback: tags the response as unmatched.
pub async fn unmatched() -> Response {
    Funneled::Unmatched.into_placeholder()
}
