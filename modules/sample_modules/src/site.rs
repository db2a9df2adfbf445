//! `site`: the browser-facing sample module.
//!
//! Serves the rendered shell page, signs people in through the session and
//! exposes the account routes the page talks to.

use std::sync::Arc;

use anyhow::Context;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::{json, Value};
use svckit::{
    Operation, RequestError, RouteComponent, RouteComponentConfig, RouteComponentInit, RouteDescriptor, TaskInput,
};

use crate::routes::{accounts, credentials, Routes};

pub const MODULE: &str = "site";

pub fn settings() -> Value {
    json!({
        "unauthorized_redirect_route": "/login",
        "anonymous_access_routes": ["/login", "/session/login", "/accounts/create"],
        "not_found_redirect_routes": { "default": "/login", "authenticated": "/home" },
        "site_title": "Svckit sample",
    })
}

async fn page(input: TaskInput) -> Result<Response, RequestError> {
    let ctx = &input.ctx;
    let client = ctx
        .config
        .clients
        .get(ctx.module_name.as_ref())
        .with_context(|| format!("client module '{}' is not configured", ctx.module_name))?;
    let layout = ctx.config.resolve_path(&client.public_path).join("layout.html");
    let html = tokio::fs::read_to_string(&layout)
        .await
        .with_context(|| format!("cannot read {}", layout.display()))?;
    Ok(Html(html).into_response())
}

async fn login(input: TaskInput) -> Result<Response, RequestError> {
    let (email, password) = credentials(&input.body)?;
    let account = accounts(&input)?.verify_credentials(email, password).await?;

    let session = input
        .session()
        .context("client request without a session")?;
    session.login(account.clone());
    tracing::info!(parent: &input.ctx.span, account = %account["id"], "signed in");
    Ok(Json(json!({ "account": account })).into_response())
}

async fn logout(input: TaskInput) -> Result<Response, RequestError> {
    if let Some(session) = input.session() {
        session.logout();
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn me(input: TaskInput) -> Result<Response, RequestError> {
    match input.session().and_then(|s| s.user()) {
        Some(user) => Ok(Json(json!({ "account": user })).into_response()),
        None => Err(RequestError::safe(StatusCode::UNAUTHORIZED, "Not signed in.")),
    }
}

pub fn accounts_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    let routes = Routes::new(RouteComponentConfig {
        component_name: "accounts".into(),
        component_name_singular: "account".into(),
        routes: vec![RouteDescriptor::get("/accounts/me", Operation::custom("me"))],
        add_default_routes: vec![Operation::Create, Operation::Read, Operation::Update],
        route_prefix: String::new(),
    })
    .handler("me", me);
    Ok(Arc::new(routes))
}

pub fn session_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    let routes = Routes::new(RouteComponentConfig {
        component_name: "session".into(),
        component_name_singular: "session".into(),
        routes: vec![
            RouteDescriptor::get(["/", "/home", "/login"], Operation::custom("page")),
            RouteDescriptor::post("/session/login", Operation::custom("login")),
            RouteDescriptor::post("/session/logout", Operation::custom("logout")),
        ],
        add_default_routes: Vec::new(),
        route_prefix: String::new(),
    })
    .handler("page", page)
    .handler("login", login)
    .handler("logout", logout);
    Ok(Arc::new(routes))
}
