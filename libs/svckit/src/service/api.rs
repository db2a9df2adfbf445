use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use svckit_bootstrap::ApiModuleConfig;

use super::body::json_body;
use super::{core_router, outer_layers, ServiceDeps, ServiceError};
use crate::auth::TokenGate;
use crate::module::Module;

/// Machine-facing service for one api module.
///
/// Every mounted path not in the module's anonymous allowlist requires a
/// bearer token signed with the module's secret.
pub fn build_api_router(module: &Module, deps: &ServiceDeps, cfg: &ApiModuleConfig) -> Result<Router, ServiceError> {
    let gate = Arc::new(TokenGate {
        module: module.name.clone(),
        secret: Arc::from(cfg.jwt.secret.as_str()),
        tokens: deps.services.tokens.clone(),
    });

    let router = core_router(module, deps, Some(&gate))?.layer(from_fn_with_state(deps.body_limits(), json_body));

    tracing::debug!(
        module = %module.name,
        routes = module.routes().len(),
        anonymous = module.settings.anonymous_access_routes.len(),
        "api service assembled"
    );
    Ok(outer_layers(router, module, deps.config.server.body_limit_bytes))
}
