//! Route descriptors and the shared base every route component builds on.

use std::fmt;

use http::Method;

mod query;
mod task;

pub use query::decode_scalar_query;
pub use task::{TaskFuture, TaskHandler, TaskInput};

/// What a route does when it matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    ReadAssociated,
    ReadList,
    Update,
    Delete,
    /// Resolved through [`crate::RouteComponent::custom_handler`].
    Custom(String),
}

impl Operation {
    /// Operations that can be generated as default routes, in generation order.
    pub const DEFAULTS: [Operation; 6] = [
        Operation::Create,
        Operation::Read,
        Operation::ReadAssociated,
        Operation::ReadList,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn custom(name: impl Into<String>) -> Self {
        Operation::Custom(name.into())
    }

    /// Path segment used for generated routes.
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::ReadAssociated => "readAssociated",
            Operation::ReadList => "readList",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Custom(name) => name,
        }
    }

    /// Method of the generated route; read and delete take query-string input.
    pub fn default_method(&self) -> Option<Method> {
        match self {
            Operation::Read | Operation::Delete => Some(Method::GET),
            Operation::Custom(_) => None,
            _ => Some(Method::POST),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Operation::Custom(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One path or a list of aliases mounted to the same handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutePath {
    Single(String),
    Aliases(Vec<String>),
}

impl RoutePath {
    pub fn paths(&self) -> &[String] {
        match self {
            RoutePath::Single(p) => std::slice::from_ref(p),
            RoutePath::Aliases(ps) => ps,
        }
    }
}

impl From<&str> for RoutePath {
    fn from(p: &str) -> Self {
        RoutePath::Single(p.to_string())
    }
}

impl From<String> for RoutePath {
    fn from(p: String) -> Self {
        RoutePath::Single(p)
    }
}

impl<const N: usize> From<[&str; N]> for RoutePath {
    fn from(ps: [&str; N]) -> Self {
        RoutePath::Aliases(ps.iter().map(|p| p.to_string()).collect())
    }
}

impl From<Vec<String>> for RoutePath {
    fn from(ps: Vec<String>) -> Self {
        RoutePath::Aliases(ps)
    }
}

/// Immutable binding of method + path(s) to an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub method: Method,
    pub path: RoutePath,
    pub operation: Operation,
}

impl RouteDescriptor {
    pub fn new(method: Method, path: impl Into<RoutePath>, operation: Operation) -> Self {
        Self {
            method,
            path: path.into(),
            operation,
        }
    }

    pub fn get(path: impl Into<RoutePath>, operation: Operation) -> Self {
        Self::new(Method::GET, path, operation)
    }

    pub fn post(path: impl Into<RoutePath>, operation: Operation) -> Self {
        Self::new(Method::POST, path, operation)
    }
}

/// Construction record for [`RouteComponentBase`].
#[derive(Clone, Debug, Default)]
pub struct RouteComponentConfig {
    /// Plural name; also the persistence component default tasks call.
    pub component_name: String,
    /// Key wrapping create/read results.
    pub component_name_singular: String,
    pub routes: Vec<RouteDescriptor>,
    pub add_default_routes: Vec<Operation>,
    pub route_prefix: String,
}

/// Route table plus the six default task handlers.
#[derive(Clone, Debug)]
pub struct RouteComponentBase {
    component_name: String,
    component_name_singular: String,
    routes: Vec<RouteDescriptor>,
}

impl RouteComponentBase {
    pub fn new(cfg: RouteComponentConfig) -> Self {
        let RouteComponentConfig {
            component_name,
            component_name_singular,
            mut routes,
            add_default_routes,
            route_prefix,
        } = cfg;

        let mut generated = Vec::new();
        for op in add_default_routes {
            let Some(method) = op.default_method() else {
                tracing::debug!(component = %component_name, operation = %op, "custom operations have no default route");
                continue;
            };
            let taken = routes.iter().chain(generated.iter()).any(|r: &RouteDescriptor| r.operation == op);
            if taken {
                continue;
            }
            let path = format!("{route_prefix}/{component_name}/{}", op.as_str());
            generated.push(RouteDescriptor::new(method, path, op));
        }
        routes.extend(generated);

        Self {
            component_name,
            component_name_singular,
            routes,
        }
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn component_name_singular(&self) -> &str {
        &self.component_name_singular
    }

    /// Custom descriptors first, then generated defaults.
    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    /// Built-in handler for one of the six default operations.
    pub fn default_task(&self, op: &Operation) -> Option<TaskHandler> {
        if op.is_custom() {
            return None;
        }
        Some(task::default_task(
            &self.component_name,
            &self.component_name_singular,
            op.clone(),
        ))
    }
}
