//! Per-module HTTP services.
//!
//! A service is an axum [`Router`] built from a loaded [`Module`]. Both
//! families share the same skeleton (outermost first):
//!
//! request id → trace span → body limit → family stages → terminal stage →
//! context stage (route layer over the mounted paths) → mounted routes
//!
//! Everything below the terminal stage reports failures by tagging the
//! response with [`Funneled`]; the terminal stage writes the final response.

pub mod api;
pub mod body;
pub mod client;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::{Json, Router};
use serde_json::json;
use svckit_bootstrap::AppConfig;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::field::Empty;
use tracing::Instrument;

use crate::auth::{require_token, AuthState, TokenGate};
use crate::context::RequestContext;
use crate::error::{unmatched, Funneled, RequestError};
use crate::module::{Module, MountedRoute};
use crate::persistence::Db;
use crate::registry::Family;
use crate::route::{TaskHandler, TaskInput};
use crate::services::Collaborators;
use crate::settings::ModuleSettings;

pub use api::build_api_router;
pub use body::{BodyLimits, BodyRejection, ParsedBody};
pub use client::build_client_router;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("module '{module}' mounts unsupported method {method} on {path}")]
    UnsupportedMethod {
        module: String,
        method: http::Method,
        path: String,
    },
    #[error("invalid session configuration for client module '{module}'")]
    Session {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Process-wide state every service shares.
#[derive(Clone)]
pub struct ServiceDeps {
    pub db: Arc<Db>,
    pub services: Collaborators,
    pub config: Arc<AppConfig>,
}

impl ServiceDeps {
    fn body_limits(&self) -> Arc<BodyLimits> {
        Arc::new(BodyLimits {
            max_bytes: self.config.server.body_limit_bytes,
            upload_dir: self.config.upload_dir(),
        })
    }
}

/// State of the context stage for one module.
struct ContextStage {
    module: Arc<str>,
    family: Family,
    settings: Arc<ModuleSettings>,
    deps: ServiceDeps,
    timeout: Duration,
}

/// 302 with a `Location` header.
pub(crate) fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(e) => RequestError::new(anyhow::anyhow!("invalid redirect target '{location}': {e}")).into_response(),
    }
}

async fn context_stage(State(stage): State<Arc<ContextStage>>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    tracing::info!(module = %stage.module, %path, "request");
    if let Some(ParsedBody(body)) = req.extensions().get::<ParsedBody>() {
        tracing::debug!(module = %stage.module, %body, "request body");
    }

    if stage.family == Family::Client {
        if let Some(target) = &stage.settings.unauthorized_redirect_route {
            let authenticated = req
                .extensions()
                .get::<AuthState>()
                .is_some_and(AuthState::is_authenticated);
            if !authenticated && path != *target && !stage.settings.allows_anonymous(&path) {
                tracing::debug!(module = %stage.module, %path, %target, "unauthenticated; redirecting");
                return found(target);
            }
        }
    }

    if let Some(rejection) = req.extensions_mut().remove::<BodyRejection>() {
        return RequestError::new(anyhow::anyhow!(rejection.reason.clone()))
            .with_status(rejection.status)
            .with_safe_message(if rejection.status == StatusCode::PAYLOAD_TOO_LARGE {
                "Request body is too large."
            } else {
                "Request body could not be parsed."
            })
            .into_response();
    }

    let span = tracing::info_span!("task", module = %stage.module, family = %stage.family, %path);
    let ctx = RequestContext {
        module_name: stage.module.clone(),
        family: stage.family,
        db: stage.deps.db.clone(),
        services: stage.deps.services.clone(),
        settings: stage.settings.clone(),
        config: stage.deps.config.clone(),
        original_url: path,
        span: span.clone(),
    };
    req.extensions_mut().insert(Arc::new(ctx));

    match tokio::time::timeout(stage.timeout, next.run(req).instrument(span)).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(module = %stage.module, timeout = ?stage.timeout, "request timed out");
            RequestError::timeout(stage.timeout).into_response()
        }
    }
}

struct TerminalStage {
    module: Arc<str>,
    family: Family,
    settings: Arc<ModuleSettings>,
}

async fn terminal_stage(State(stage): State<Arc<TerminalStage>>, req: Request, next: Next) -> Response {
    let authenticated = req
        .extensions()
        .get::<AuthState>()
        .is_some_and(AuthState::is_authenticated);

    let mut res = next.run(req).await;
    match res.extensions_mut().remove::<Funneled>() {
        None => res,
        Some(Funneled::Unmatched) => match stage.family {
            Family::Client => {
                let redirects = &stage.settings.not_found_redirect_routes;
                found(if authenticated {
                    &redirects.authenticated
                } else {
                    &redirects.default
                })
            }
            Family::Api => (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found." }))).into_response(),
        },
        Some(Funneled::Error(err)) => {
            let status = err.status();
            if status.is_server_error() {
                tracing::error!(module = %stage.module, status = status.as_u16(), error = ?err, "request failed");
            } else {
                tracing::warn!(module = %stage.module, status = status.as_u16(), error = %err, "request rejected");
            }
            (status, Json(json!({ "error": err.public_message() }))).into_response()
        }
    }
}

async fn run_task(task: TaskHandler, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let Some(ctx) = parts.extensions.remove::<Arc<RequestContext>>() else {
        return RequestError::new(anyhow::anyhow!("request reached a task without a context")).into_response();
    };
    let body = parts
        .extensions
        .remove::<ParsedBody>()
        .map(|b| b.0)
        .unwrap_or_else(|| json!({}));

    match task.call(TaskInput { ctx, parts, body }).await {
        Ok(res) => res,
        Err(err) => err.into_response(),
    }
}

/// Mount the flattened routes. Api paths outside the anonymous allowlist get
/// the token gate.
fn mount(module: &Module, gate: Option<&Arc<TokenGate>>) -> Result<Router, ServiceError> {
    let mut by_path: BTreeMap<&str, Vec<&MountedRoute>> = BTreeMap::new();
    for route in module.routes() {
        by_path.entry(route.router_path.as_str()).or_default().push(route);
    }

    let mut router = Router::new();
    for (path, routes) in by_path {
        let mut method_router: Option<MethodRouter> = None;
        for route in &routes {
            let filter = MethodFilter::try_from(route.method.clone()).map_err(|_| ServiceError::UnsupportedMethod {
                module: module.name.to_string(),
                method: route.method.clone(),
                path: route.path.clone(),
            })?;
            let task = route.task.clone();
            let handler = move |req: Request| run_task(task.clone(), req);
            method_router = Some(match method_router {
                Some(mr) => mr.on(filter, handler),
                None => on(filter, handler),
            });
        }
        let Some(mut method_router) = method_router else {
            continue;
        };
        method_router = method_router.fallback(unmatched);

        // Every method on a path shares its allowlist entry.
        let gated = !module.settings.allows_anonymous(&routes[0].path);
        if let (true, Some(gate)) = (gated, gate) {
            method_router = method_router.route_layer(from_fn_with_state(gate.clone(), require_token));
        }
        router = router.route(path, method_router);
    }
    Ok(router.fallback(unmatched))
}

/// Terminal stage, context stage and the mounted routes.
fn core_router(module: &Module, deps: &ServiceDeps, gate: Option<&Arc<TokenGate>>) -> Result<Router, ServiceError> {
    let mut router = mount(module, gate)?;
    if !module.routes().is_empty() {
        let context = Arc::new(ContextStage {
            module: module.name.clone(),
            family: module.family,
            settings: module.settings.clone(),
            deps: deps.clone(),
            timeout: Duration::from_secs(deps.config.server.request_timeout_sec),
        });
        router = router.route_layer(from_fn_with_state(context, context_stage));
    }
    let terminal = Arc::new(TerminalStage {
        module: module.name.clone(),
        family: module.family,
        settings: module.settings.clone(),
    });
    Ok(router.layer(from_fn_with_state(terminal, terminal_stage)))
}

/// Body limit, trace span and request id; applied last so they sit outermost.
fn outer_layers(router: Router, module: &Module, body_limit: usize) -> Router {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let module_name = module.name.clone();
    let family = module.family;

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |req: &Request| {
                    let rid = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("n/a");
                    tracing::info_span!(
                        "http_request",
                        module = %module_name,
                        family = %family,
                        method = %req.method(),
                        uri = %req.uri().path(),
                        request_id = %rid,
                        status = Empty,
                        latency_ms = Empty,
                    )
                })
                .on_response(|res: &Response, latency: Duration, span: &tracing::Span| {
                    span.record("status", res.status().as_u16());
                    span.record("latency_ms", latency.as_millis() as u64);
                }),
        )
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}
