use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::contracts::RouteComponent;
use crate::registry::{Family, ModuleEntry, RouteComponentInit};
use crate::route::{Operation, TaskHandler};
use crate::settings::ModuleSettings;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("invalid settings for {family} module '{module}'")]
    Settings {
        module: String,
        family: Family,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to instantiate route component '{component}' of module '{module}'")]
    Component {
        module: String,
        component: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("route component '{component}' of module '{module}' has no handler for '{operation}'")]
    UnknownHandler {
        module: String,
        component: String,
        operation: Operation,
    },
    #[error("route component '{component}' of module '{module}' declares invalid path '{path}': {reason}")]
    InvalidPath {
        module: String,
        component: String,
        path: String,
        reason: &'static str,
    },
    #[error("module '{module}' mounts {method} {path} more than once")]
    DuplicateRoute {
        module: String,
        method: Method,
        path: String,
    },
}

/// One flattened (method, path) entry ready to be mounted.
#[derive(Clone, Debug)]
pub struct MountedRoute {
    /// Path as declared; matched against the anonymous-access list.
    pub path: String,
    /// Path in router syntax (`:id` becomes `{id}`).
    pub router_path: String,
    pub method: Method,
    pub component: String,
    pub operation: Operation,
    pub task: TaskHandler,
}

/// A loaded client or api module.
pub struct Module {
    pub name: Arc<str>,
    pub family: Family,
    pub settings: Arc<ModuleSettings>,
    pub components: BTreeMap<String, Arc<dyn RouteComponent>>,
    routes: Vec<MountedRoute>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("routes", &self.routes.len())
            .finish()
    }
}

fn router_path(path: &str) -> Result<String, &'static str> {
    if !path.starts_with('/') {
        return Err("paths must start with '/'");
    }
    let segments: Vec<String> = path
        .split('/')
        .map(|seg| {
            if let Some(name) = seg.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = seg.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                seg.to_string()
            }
        })
        .collect();
    if segments.iter().any(|s| s == "{}" || s == "{*}") {
        return Err("parameters need a name");
    }
    Ok(segments.join("/"))
}

impl Module {
    /// Resolve settings, instantiate components and flatten their routes.
    pub fn load(entry: &ModuleEntry, configured: Option<&Value>) -> Result<Self, ModuleError> {
        let registered = entry.settings.map(|f| f());
        if registered.is_none() {
            tracing::info!(
                module = entry.name,
                family = %entry.family,
                "no settings override registered; using family defaults"
            );
        }
        let settings = ModuleSettings::resolve(entry.family, registered.as_ref(), configured)
            .map_err(|source| ModuleError::Settings {
                module: entry.name.to_string(),
                family: entry.family,
                source,
            })?;
        let settings = Arc::new(settings);

        let init = RouteComponentInit {
            module: entry.name,
            family: entry.family,
            settings: &settings,
        };
        let mut components = BTreeMap::new();
        for (name, factory) in &entry.components {
            let component = factory(&init).map_err(|source| ModuleError::Component {
                module: entry.name.to_string(),
                component: name.to_string(),
                source,
            })?;
            components.insert(name.to_string(), component);
        }

        let routes = flatten(entry.name, &components)?;
        tracing::debug!(module = entry.name, family = %entry.family, routes = routes.len(), "module loaded");

        Ok(Self {
            name: Arc::from(entry.name),
            family: entry.family,
            settings,
            components,
            routes,
        })
    }

    pub fn routes(&self) -> &[MountedRoute] {
        &self.routes
    }
}

fn flatten(
    module: &str,
    components: &BTreeMap<String, Arc<dyn RouteComponent>>,
) -> Result<Vec<MountedRoute>, ModuleError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (name, component) in components {
        for descriptor in component.base().routes() {
            let task = component
                .task(&descriptor.operation)
                .ok_or_else(|| ModuleError::UnknownHandler {
                    module: module.to_string(),
                    component: name.clone(),
                    operation: descriptor.operation.clone(),
                })?;

            for path in descriptor.path.paths() {
                let mounted = router_path(path).map_err(|reason| ModuleError::InvalidPath {
                    module: module.to_string(),
                    component: name.clone(),
                    path: path.clone(),
                    reason,
                })?;
                if !seen.insert((descriptor.method.clone(), mounted.clone())) {
                    return Err(ModuleError::DuplicateRoute {
                        module: module.to_string(),
                        method: descriptor.method.clone(),
                        path: path.clone(),
                    });
                }
                out.push(MountedRoute {
                    path: path.clone(),
                    router_path: mounted,
                    method: descriptor.method.clone(),
                    component: name.clone(),
                    operation: descriptor.operation.clone(),
                    task: task.clone(),
                });
            }
        }
    }
    Ok(out)
}
