use std::sync::Arc;

use crate::contracts::{PersistenceComponent, RouteComponent};
use crate::persistence::{PersistenceInit, SchemaBuilder};
use crate::registry::{Family, Registry, RouteComponentInit};
use crate::route::{Operation, RouteComponentBase, RouteComponentConfig};

struct Notes;

#[async_trait::async_trait]
impl PersistenceComponent for Notes {
    fn name(&self) -> &str {
        "notes"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn notes(_: &mut SchemaBuilder, _: &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>> {
    Ok(Arc::new(Notes))
}

struct NotesRoutes(RouteComponentBase);

impl RouteComponent for NotesRoutes {
    fn base(&self) -> &RouteComponentBase {
        &self.0
    }
}

fn notes_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    Ok(Arc::new(NotesRoutes(RouteComponentBase::new(RouteComponentConfig {
        component_name: "notes".into(),
        component_name_singular: "note".into(),
        routes: Vec::new(),
        add_default_routes: Operation::DEFAULTS.to_vec(),
        route_prefix: String::new(),
    }))))
}

fn desk_settings() -> serde_json::Value {
    serde_json::json!({ "anonymous_access_routes": ["/notes/read"] })
}

crate::register_persistence!("notes", notes);
crate::register_client_module!("desk");
crate::register_api_module!("desk_api", settings = desk_settings);
crate::register_client_component!("desk", "notes", notes_routes);
crate::register_api_component!("desk_api", "notes", notes_routes);
crate::register_persistence!("notes.bak", notes);

#[test]
fn macros_register_through_inventory() {
    let registry = Registry::discover().expect("registry builds");

    assert!(registry.persistence().any(|(name, _)| name == "notes"));
    assert!(!registry.persistence().any(|(name, _)| name == "notes.bak"));

    let desk = registry.module(Family::Client, "desk").expect("client module");
    assert!(desk.settings.is_none());
    assert!(desk.components.contains_key("notes"));

    let api = registry.module(Family::Api, "desk_api").expect("api module");
    assert_eq!(api.settings.map(|f| f()), Some(desk_settings()));
    assert!(registry.module(Family::Client, "desk_api").is_none());
}
