use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RequestError;
use crate::persistence::DbHandle;
use crate::route::{Operation, RouteComponentBase, TaskHandler};

/// All persistence components by name.
pub type ComponentMap = BTreeMap<String, Arc<dyn PersistenceComponent>>;

/// Scalar filter decoded from a query string.
pub type Filter = Map<String, Value>;

/// A persistence entity.
///
/// Wiring happens in two phases: `associate` runs on every component before
/// `set_db` runs on any. Implementations keep late-bound state behind interior
/// mutability (`ArcSwapOption` and friends) since both hooks take `&self`.
///
/// The six operations default to a 501 failure so a component implements only
/// what its routes use.
#[async_trait]
pub trait PersistenceComponent: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Resolve references to neighbours. The map is complete when this runs.
    fn associate(&self, _components: &ComponentMap) -> anyhow::Result<()> {
        Ok(())
    }

    /// Receive the assembled persistence layer.
    fn set_db(&self, _db: DbHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create(&self, _body: Value) -> Result<Value, RequestError> {
        Err(RequestError::not_supported(self.name(), &Operation::Create))
    }

    async fn read(&self, _filter: Filter) -> Result<Value, RequestError> {
        Err(RequestError::not_supported(self.name(), &Operation::Read))
    }

    async fn read_associated(&self, _body: Value) -> Result<Value, RequestError> {
        Err(RequestError::not_supported(self.name(), &Operation::ReadAssociated))
    }

    async fn read_list(&self, _body: Value) -> Result<Value, RequestError> {
        Err(RequestError::not_supported(self.name(), &Operation::ReadList))
    }

    async fn update(&self, _body: Value) -> Result<Value, RequestError> {
        Err(RequestError::not_supported(self.name(), &Operation::Update))
    }

    async fn delete(&self, _filter: Filter) -> Result<Value, RequestError> {
        Err(RequestError::not_supported(self.name(), &Operation::Delete))
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// A network-facing component of a client or api module.
pub trait RouteComponent: Send + Sync + 'static {
    fn base(&self) -> &RouteComponentBase;

    /// Handler for `Operation::Custom(name)` descriptors.
    fn custom_handler(&self, _name: &str) -> Option<TaskHandler> {
        None
    }

    /// Handler mounted for `op`; defaults come from the base.
    fn task(&self, op: &Operation) -> Option<TaskHandler> {
        match op {
            Operation::Custom(name) => self.custom_handler(name),
            _ => self.base().default_task(op),
        }
    }
}
