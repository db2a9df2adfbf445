use std::collections::HashMap;
use std::future::Future;

use axum::response::Response;
use svckit::{RequestError, RouteComponent, RouteComponentBase, RouteComponentConfig, TaskHandler, TaskInput};

/// Route component made of a base plus named custom handlers.
pub(crate) struct Routes {
    base: RouteComponentBase,
    custom: HashMap<&'static str, TaskHandler>,
}

impl Routes {
    pub(crate) fn new(cfg: RouteComponentConfig) -> Self {
        Self {
            base: RouteComponentBase::new(cfg),
            custom: HashMap::new(),
        }
    }

    pub(crate) fn handler<F, Fut>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, RequestError>> + Send + 'static,
    {
        self.custom.insert(name, TaskHandler::new(f));
        self
    }
}

impl RouteComponent for Routes {
    fn base(&self) -> &RouteComponentBase {
        &self.base
    }

    fn custom_handler(&self, name: &str) -> Option<TaskHandler> {
        self.custom.get(name).cloned()
    }
}

/// `(email, password)` from a login body.
pub(crate) fn credentials(body: &serde_json::Value) -> Result<(&str, &str), RequestError> {
    let field = |key: &str| body.get(key).and_then(serde_json::Value::as_str).filter(|v| !v.is_empty());
    match (field("email"), field("password")) {
        (Some(email), Some(password)) => Ok((email, password)),
        _ => Err(RequestError::bad_request("Email and password are required.")),
    }
}

pub(crate) fn accounts(input: &TaskInput) -> Result<&crate::persistence::Accounts, RequestError> {
    input
        .ctx
        .db
        .component_as::<crate::persistence::Accounts>(crate::persistence::accounts::NAME)
        .ok_or_else(|| RequestError::new(anyhow::anyhow!("accounts component is not available")))
}
