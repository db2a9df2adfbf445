//! `mobile`: the token-gated sample api.

use std::sync::Arc;

use anyhow::Context;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use svckit::{
    Operation, RequestError, RouteComponent, RouteComponentConfig, RouteComponentInit, RouteDescriptor, TaskInput,
};

use crate::routes::{accounts, credentials, Routes};

pub const MODULE: &str = "mobile";

pub fn settings() -> Value {
    json!({
        "anonymous_access_routes": ["/auth/token", "/accounts/create"],
    })
}

/// Exchange credentials for a bearer token.
async fn token(input: TaskInput) -> Result<Response, RequestError> {
    let (email, password) = credentials(&input.body)?;
    let account = accounts(&input)?.verify_credentials(email, password).await?;
    let subject = account
        .get("id")
        .map(|id| id.to_string())
        .context("account without an id")?;
    let token = input.ctx.issue_token(&subject, json!({ "email": email }))?;
    Ok(Json(json!({ "token": token, "account": account })).into_response())
}

async fn revoke(input: TaskInput) -> Result<Response, RequestError> {
    let claims = input.claims().context("gated route without claims")?;
    input
        .ctx
        .tokens()
        .revoke(claims)
        .await
        .context("failed to revoke token")?;
    Ok(Json(json!({ "revoked": true })).into_response())
}

pub fn accounts_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    Ok(Arc::new(Routes::new(RouteComponentConfig {
        component_name: "accounts".into(),
        component_name_singular: "account".into(),
        routes: Vec::new(),
        add_default_routes: vec![
            Operation::Create,
            Operation::Read,
            Operation::ReadList,
            Operation::Update,
            Operation::Delete,
        ],
        route_prefix: String::new(),
    })))
}

pub fn roles_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    Ok(Arc::new(Routes::new(RouteComponentConfig {
        component_name: "roles".into(),
        component_name_singular: "role".into(),
        routes: Vec::new(),
        add_default_routes: vec![Operation::Read, Operation::ReadAssociated],
        route_prefix: String::new(),
    })))
}

pub fn auth_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    let routes = Routes::new(RouteComponentConfig {
        component_name: "auth".into(),
        component_name_singular: "auth".into(),
        routes: vec![
            RouteDescriptor::post("/auth/token", Operation::custom("token")),
            RouteDescriptor::post("/auth/revoke", Operation::custom("revoke")),
        ],
        add_default_routes: Vec::new(),
        route_prefix: String::new(),
    })
    .handler("token", token)
    .handler("revoke", revoke);
    Ok(Arc::new(routes))
}
