//! The persistence layer: wired components plus the optional SQL pool.

use std::sync::{Arc, Weak};

use sqlx::AnyPool;
use svckit_bootstrap::AppConfig;

use crate::contracts::{ComponentMap, PersistenceComponent};
use crate::services::Collaborators;

/// Assembled persistence layer shared by every service.
pub struct Db {
    components: ComponentMap,
    pool: Option<AnyPool>,
}

impl Db {
    pub fn component(&self, name: &str) -> Option<&Arc<dyn PersistenceComponent>> {
        self.components.get(name)
    }

    pub fn components(&self) -> &ComponentMap {
        &self.components
    }

    pub fn pool(&self) -> Option<&AnyPool> {
        self.pool.as_ref()
    }

    /// Downcast a component to its concrete type.
    pub fn component_as<T: 'static>(&self, name: &str) -> Option<&T> {
        self.components.get(name)?.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("has_pool", &self.pool.is_some())
            .finish()
    }
}

/// Non-owning handle given to components in `set_db`.
///
/// Components live inside [`Db`]; a strong reference back would form a cycle.
#[derive(Clone, Debug)]
pub struct DbHandle(Weak<Db>);

impl DbHandle {
    pub fn upgrade(&self) -> Option<Arc<Db>> {
        self.0.upgrade()
    }

    pub fn component(&self, name: &str) -> Option<Arc<dyn PersistenceComponent>> {
        self.0.upgrade()?.component(name).cloned()
    }

    pub fn pool(&self) -> Option<AnyPool> {
        self.0.upgrade()?.pool.clone()
    }
}

/// Passed to every persistence factory.
#[derive(Clone)]
pub struct PersistenceInit {
    pub name: String,
    pub pool: Option<AnyPool>,
    pub services: Collaborators,
    pub config: Arc<AppConfig>,
}

/// DDL collected from components during instantiation.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    statements: Vec<(String, String)>,
}

impl SchemaBuilder {
    pub fn add(&mut self, component: &str, ddl: impl Into<String>) {
        self.statements.push((component.to_string(), ddl.into()));
    }

    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().map(|(_, s)| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Run every collected statement in registration order.
    pub async fn sync(&self, pool: Option<&AnyPool>, log_statements: bool) -> Result<usize, SchemaError> {
        let Some(pool) = pool else {
            if !self.is_empty() {
                tracing::warn!(
                    statements = self.statements.len(),
                    "no database configured; skipping schema sync"
                );
            }
            return Ok(0);
        };

        for (component, ddl) in &self.statements {
            if log_statements {
                tracing::debug!(%component, sql = %ddl, "schema sync");
            }
            sqlx::query(ddl)
                .execute(pool)
                .await
                .map_err(|source| SchemaError {
                    component: component.clone(),
                    source,
                })?;
        }
        tracing::info!(statements = self.statements.len(), "schema synchronized");
        Ok(self.statements.len())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("schema statement from '{component}' failed")]
pub struct SchemaError {
    pub component: String,
    #[source]
    pub source: sqlx::Error,
}

/// Failure while wiring instantiated components.
#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("associate failed for persistence component '{component}'")]
    Associate {
        component: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("set_db failed for persistence component '{component}'")]
    SetDb {
        component: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Two-phase wiring: `associate` on all, then `set_db` on all.
pub fn wire(components: ComponentMap, pool: Option<AnyPool>) -> Result<Arc<Db>, WiringError> {
    for (name, component) in &components {
        component
            .associate(&components)
            .map_err(|source| WiringError::Associate {
                component: name.clone(),
                source,
            })?;
    }

    let db = Arc::new(Db { components, pool });
    let handle = DbHandle(Arc::downgrade(&db));
    for (name, component) in &db.components {
        component
            .set_db(handle.clone())
            .map_err(|source| WiringError::SetDb {
                component: name.clone(),
                source,
            })?;
    }
    Ok(db)
}

impl Db {
    /// A layer without components or storage.
    pub fn empty() -> Arc<Db> {
        Arc::new(Db {
            components: ComponentMap::new(),
            pool: None,
        })
    }
}
