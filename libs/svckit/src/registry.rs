use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::{PersistenceComponent, RouteComponent};
use crate::persistence::{PersistenceInit, SchemaBuilder};
use crate::settings::ModuleSettings;

/// The two families of network-facing modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Browser-facing: sessions, static files, redirects.
    Client,
    /// Machine-facing: bearer tokens, JSON 404s.
    Api,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Client => "client",
            Family::Api => "api",
        })
    }
}

pub type PersistenceFactory =
    fn(&mut SchemaBuilder, &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>>;

/// What a route component factory receives.
pub struct RouteComponentInit<'a> {
    pub module: &'a str,
    pub family: Family,
    pub settings: &'a Arc<ModuleSettings>,
}

pub type RouteFactory = fn(&RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>>;

/// Module-level settings override unit.
pub type SettingsOverride = fn() -> serde_json::Value;

pub struct ModuleEntry {
    pub name: &'static str,
    pub family: Family,
    pub settings: Option<SettingsOverride>,
    pub components: BTreeMap<&'static str, RouteFactory>,
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("has_settings_override", &self.settings.is_some())
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The function type submitted by the `register_*!` macros via `inventory::submit!`.
pub struct Registrator(pub fn(&mut RegistryBuilder));

inventory::collect!(Registrator);

/// Everything the orchestrator can instantiate, keyed by name.
pub struct Registry {
    persistence: BTreeMap<&'static str, PersistenceFactory>,
    modules: BTreeMap<(Family, &'static str), ModuleEntry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("persistence", &self.persistence.keys().collect::<Vec<_>>())
            .field("modules", &self.modules.values().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Discover via inventory, have registrators fill the builder, then validate.
    pub fn discover() -> Result<Self, RegistryError> {
        let mut b = RegistryBuilder::default();
        for r in ::inventory::iter::<Registrator> {
            r.0(&mut b);
        }
        b.build()
    }

    pub fn persistence(&self) -> impl Iterator<Item = (&'static str, PersistenceFactory)> + '_ {
        self.persistence.iter().map(|(n, f)| (*n, *f))
    }

    pub fn modules(&self, family: Family) -> impl Iterator<Item = &ModuleEntry> + '_ {
        self.modules
            .iter()
            .filter(move |((f, _), _)| *f == family)
            .map(|(_, m)| m)
    }

    pub fn module(&self, family: Family, name: &str) -> Option<&ModuleEntry> {
        self.modules
            .iter()
            .find(|((f, n), _)| *f == family && *n == name)
            .map(|(_, m)| m)
    }
}

/// Collects registrations from macros or from code; validated by [`RegistryBuilder::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    persistence: BTreeMap<&'static str, PersistenceFactory>,
    modules: BTreeMap<(Family, &'static str), ModuleEntry>,
    components: Vec<(Family, &'static str, &'static str, RouteFactory)>,
    errors: Vec<String>,
}

/// Dotted names stand for files and hidden entries and are skipped.
fn ignored(kind: &str, name: &str) -> bool {
    if name.contains('.') {
        tracing::warn!(kind, name, "ignoring registration: names must not contain '.'");
        return true;
    }
    false
}

impl RegistryBuilder {
    pub fn register_persistence(&mut self, name: &'static str, factory: PersistenceFactory) -> &mut Self {
        if ignored("persistence component", name) {
            return self;
        }
        if self.persistence.insert(name, factory).is_some() {
            self.errors
                .push(format!("Persistence component '{name}' is already registered"));
        }
        self
    }

    pub fn register_module(
        &mut self,
        family: Family,
        name: &'static str,
        settings: Option<SettingsOverride>,
    ) -> &mut Self {
        if ignored("module", name) {
            return self;
        }
        if self.modules.contains_key(&(family, name)) {
            self.errors
                .push(format!("{family} module '{name}' is already registered"));
            return self;
        }
        self.modules.insert(
            (family, name),
            ModuleEntry {
                name,
                family,
                settings,
                components: BTreeMap::new(),
            },
        );
        self
    }

    pub fn register_route_component(
        &mut self,
        family: Family,
        module: &'static str,
        name: &'static str,
        factory: RouteFactory,
    ) -> &mut Self {
        if ignored("route component", name) {
            return self;
        }
        self.components.push((family, module, name, factory));
        self
    }

    /// Attach components to their modules and report every problem at once.
    pub fn build(mut self) -> Result<Registry, RegistryError> {
        for (family, module, name, factory) in std::mem::take(&mut self.components) {
            if module.contains('.') {
                continue;
            }
            let Some(entry) = self.modules.get_mut(&(family, module)) else {
                self.errors.push(format!(
                    "Route component '{name}' names unregistered {family} module '{module}'"
                ));
                continue;
            };
            if entry.components.insert(name, factory).is_some() {
                self.errors.push(format!(
                    "Route component '{name}' is already registered in {family} module '{module}'"
                ));
            }
        }

        if !self.errors.is_empty() {
            return Err(RegistryError::InvalidRegistryConfiguration {
                errors: self.errors,
            });
        }

        let registry = Registry {
            persistence: self.persistence,
            modules: self.modules,
        };
        tracing::info!(
            persistence = ?registry.persistence.keys().collect::<Vec<_>>(),
            clients = ?registry.modules(Family::Client).map(|m| m.name).collect::<Vec<_>>(),
            apis = ?registry.modules(Family::Api).map(|m| m.name).collect::<Vec<_>>(),
            "Registry resolved"
        );
        Ok(registry)
    }
}

/// Structured errors for the component registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry configuration:\n{errors:#?}")]
    InvalidRegistryConfiguration { errors: Vec<String> },
}
