use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use svckit_bootstrap::ClientModuleConfig;
use tower_http::services::ServeDir;

use super::body::{form_body, json_body, multipart_body};
use super::{core_router, outer_layers, ServiceDeps, ServiceError};
use crate::auth;
use crate::module::Module;
use crate::session::{parse_cookies, session_stage, SessionManager};

/// Browser-facing service for one client module.
///
/// Stage order, outermost first: request id, trace, body limit, JSON, form,
/// multipart, cookies, session, auth init, session hydration, static files
/// from `public_dir`, terminal, context, routes. Static files are only served
/// for requests no file matches; everything else falls through to the app.
pub fn build_client_router(
    module: &Module,
    deps: &ServiceDeps,
    cfg: &ClientModuleConfig,
    public_dir: &Path,
) -> Result<Router, ServiceError> {
    let sessions = SessionManager::new(
        deps.services.store.clone(),
        &cfg.session.secret,
        cfg.session.key.clone(),
        Duration::from_secs(cfg.session.ttl_sec),
    )
    .map_err(|source| ServiceError::Session {
        module: module.name.to_string(),
        source,
    })?;

    let app = core_router(module, deps, None)?;
    let statics = ServeDir::new(public_dir)
        .call_fallback_on_method_not_allowed(true)
        .fallback(app);
    let limits = deps.body_limits();

    let router = Router::new()
        .fallback_service(statics)
        .layer(from_fn(auth::hydrate_from_session))
        .layer(from_fn(auth::initialize))
        .layer(from_fn_with_state(Arc::new(sessions), session_stage))
        .layer(from_fn(parse_cookies))
        .layer(from_fn_with_state(limits.clone(), multipart_body))
        .layer(from_fn_with_state(limits.clone(), form_body))
        .layer(from_fn_with_state(limits, json_body));

    tracing::debug!(
        module = %module.name,
        public_dir = %public_dir.display(),
        routes = module.routes().len(),
        "client service assembled"
    );
    Ok(outer_layers(router, module, deps.config.server.body_limit_bytes))
}
