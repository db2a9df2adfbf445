//! `roles`: role names granted to accounts. Kept in memory.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use svckit::{ComponentMap, Filter, PersistenceComponent, PersistenceInit, RequestError, SchemaBuilder};

use super::id_of;

pub const NAME: &str = "roles";

#[derive(Default)]
pub struct Roles {
    grants: DashMap<i64, Vec<String>>,
    accounts: OnceLock<Arc<dyn PersistenceComponent>>,
}

fn account_id(v: Option<&Value>) -> Result<i64, RequestError> {
    v.and_then(id_of)
        .ok_or_else(|| RequestError::bad_request("An account id is required."))
}

impl Roles {
    fn view(&self, id: i64) -> Value {
        let roles = self.grants.get(&id).map(|r| r.clone()).unwrap_or_default();
        json!({ "account_id": id, "roles": roles })
    }

    fn accounts(&self) -> Result<&Arc<dyn PersistenceComponent>, RequestError> {
        self.accounts
            .get()
            .ok_or_else(|| RequestError::new(anyhow::anyhow!("roles used before association")))
    }
}

#[async_trait]
impl PersistenceComponent for Roles {
    fn name(&self) -> &str {
        NAME
    }

    fn associate(&self, components: &ComponentMap) -> anyhow::Result<()> {
        let accounts = components
            .get(super::accounts::NAME)
            .ok_or_else(|| anyhow::anyhow!("roles needs the '{}' component", super::accounts::NAME))?;
        let _ = self.accounts.set(accounts.clone());
        Ok(())
    }

    async fn create(&self, body: Value) -> Result<Value, RequestError> {
        let id = account_id(body.get("account_id"))?;
        let role = body
            .get("role")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RequestError::bad_request("A role name is required."))?;

        let mut granted = self.grants.entry(id).or_default();
        if !granted.iter().any(|r| r == role) {
            granted.push(role.to_string());
        }
        drop(granted);
        Ok(self.view(id))
    }

    async fn read(&self, filter: Filter) -> Result<Value, RequestError> {
        Ok(self.view(account_id(filter.get("account_id"))?))
    }

    /// The account together with its roles.
    async fn read_associated(&self, body: Value) -> Result<Value, RequestError> {
        let id = account_id(body.get("account_id"))?;
        let mut by_id = Filter::new();
        by_id.insert("id".into(), json!(id));
        let account = self.accounts()?.read(by_id).await?;

        let mut out = self.view(id);
        out["account"] = account;
        Ok(out)
    }

    async fn delete(&self, filter: Filter) -> Result<Value, RequestError> {
        let id = account_id(filter.get("account_id"))?;
        let removed = self.grants.remove(&id).map(|(_, r)| r).unwrap_or_default();
        Ok(json!({ "account_id": id, "removed": removed }))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub fn factory(_: &mut SchemaBuilder, _: &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>> {
    Ok(Arc::new(Roles::default()))
}
