use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::error::RequestError;
use crate::session::Session;
use crate::token::TokenManager;

/// Who is making a client request.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum AuthState {
    #[default]
    Anonymous,
    Authenticated(Value),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    pub fn user(&self) -> Option<&Value> {
        match self {
            AuthState::Authenticated(u) => Some(u),
            AuthState::Anonymous => None,
        }
    }
}

/// Every request starts anonymous.
pub async fn initialize(mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(AuthState::Anonymous);
    next.run(req).await
}

/// Promote the request to authenticated when its session holds a user.
pub async fn hydrate_from_session(mut req: Request, next: Next) -> Response {
    if let Some(user) = req.extensions().get::<Session>().and_then(Session::user) {
        req.extensions_mut().insert(AuthState::Authenticated(user));
    }
    next.run(req).await
}

/// Token gate configuration for one api module.
#[derive(Clone)]
pub struct TokenGate {
    pub module: Arc<str>,
    pub secret: Arc<str>,
    pub tokens: TokenManager,
}

fn bearer(req: &Request) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// Reject the request with a funneled 401 unless it carries a valid token.
pub async fn require_token(State(gate): State<Arc<TokenGate>>, mut req: Request, next: Next) -> Response {
    let Some(token) = bearer(&req) else {
        return RequestError::unauthorized(anyhow::anyhow!("missing bearer token")).into_response();
    };
    match gate.tokens.validate(&gate.secret, &gate.module, token).await {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => RequestError::unauthorized(e).into_response(),
    }
}
