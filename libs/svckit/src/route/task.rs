use std::future::Future;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::{decode_scalar_query, Operation};
use crate::context::RequestContext;
use crate::contracts::PersistenceComponent;
use crate::error::RequestError;
use crate::session::Session;
use crate::token::Claims;

pub type TaskFuture = BoxFuture<'static, Result<Response, RequestError>>;

/// Request handler bound to one route descriptor.
///
/// A task either produces the success response or returns a [`RequestError`];
/// it never renders error bodies itself.
#[derive(Clone)]
pub struct TaskHandler(Arc<dyn Fn(TaskInput) -> TaskFuture + Send + Sync>);

impl TaskHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, RequestError>> + Send + 'static,
    {
        Self(Arc::new(move |input| Box::pin(f(input))))
    }

    pub async fn call(&self, input: TaskInput) -> Result<Response, RequestError> {
        (self.0)(input).await
    }
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskHandler(..)")
    }
}

/// Everything a task sees of the request.
pub struct TaskInput {
    pub ctx: Arc<RequestContext>,
    pub parts: http::request::Parts,
    /// Parsed request body; `{}` when the request had none.
    pub body: Value,
}

impl TaskInput {
    /// Scalar query parameters, see [`decode_scalar_query`].
    pub fn query(&self) -> Map<String, Value> {
        decode_scalar_query(self.parts.uri.query())
    }

    /// Server-side session (client services only).
    pub fn session(&self) -> Option<&Session> {
        self.parts.extensions.get::<Session>()
    }

    /// Verified bearer token claims (gated api routes only).
    pub fn claims(&self) -> Option<&Claims> {
        self.parts.extensions.get::<Claims>()
    }

    /// Look up a persistence component, failing the request when it is absent.
    pub fn persistence(&self, name: &str) -> Result<Arc<dyn PersistenceComponent>, RequestError> {
        self.ctx
            .db
            .component(name)
            .cloned()
            .ok_or_else(|| RequestError::new(anyhow::anyhow!("unknown persistence component '{name}'")))
    }
}

struct DefaultTask {
    component_name: String,
    component_name_singular: String,
    op: Operation,
}

impl DefaultTask {
    async fn run(&self, input: TaskInput) -> Result<Response, RequestError> {
        let component = input.persistence(&self.component_name)?;
        let result = match &self.op {
            Operation::Create => component.create(input.body).await?,
            Operation::Read => component.read(input.query()).await?,
            Operation::ReadAssociated => component.read_associated(input.body).await?,
            Operation::ReadList => component.read_list(input.body).await?,
            Operation::Update => component.update(input.body).await?,
            Operation::Delete => component.delete(input.query()).await?,
            Operation::Custom(_) => {
                return Err(RequestError::not_supported(&self.component_name, &self.op))
            }
        };

        let body = match self.op {
            Operation::Create | Operation::Read => {
                let mut wrapped = Map::new();
                wrapped.insert(self.component_name_singular.clone(), result);
                Value::Object(wrapped)
            }
            _ => result,
        };
        Ok(Json(body).into_response())
    }
}

pub(super) fn default_task(component_name: &str, singular: &str, op: Operation) -> TaskHandler {
    let task = Arc::new(DefaultTask {
        component_name: component_name.to_string(),
        component_name_singular: singular.to_string(),
        op,
    });
    TaskHandler::new(move |input| {
        let task = task.clone();
        async move { task.run(input).await }
    })
}
