//! # Svckit - pluggable service host
//!
//! Builds multi-tenant backends out of three kinds of units:
//!
//! - **persistence components**: named entities implementing
//!   [`PersistenceComponent`], wired together in two phases
//!   (`associate` on all, then `set_db` on all);
//! - **client modules**: browser-facing services with sessions, static files
//!   and redirects;
//! - **api modules**: machine-facing services gated by bearer tokens.
//!
//! Units are registered at compile time and discovered through `inventory`:
//!
//! ```rust,ignore
//! svckit::register_persistence!("accounts", accounts::factory);
//! svckit::register_client_module!("site", settings = site::settings);
//! svckit::register_client_component!("site", "accounts", site::accounts_routes);
//! ```
//!
//! [`Orchestrator::build`] wires everything; [`Orchestrator::listen`] binds
//! one listener per module. Route handlers never write error bodies: they
//! return [`RequestError`] and each service's terminal stage renders it.

pub use async_trait::async_trait;

// Re-export inventory for the registration macros
pub use inventory;

// Configuration and logging live in the bootstrap crate
pub use svckit_bootstrap as bootstrap;

pub mod auth;
pub mod context;
pub mod contracts;
pub mod error;
pub mod mail;
pub mod module;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod route;
pub mod runner;
pub mod service;
pub mod services;
pub mod session;
pub mod settings;
pub mod store;
pub mod template;
pub mod token;

pub use auth::AuthState;
pub use context::RequestContext;
pub use contracts::{ComponentMap, Filter, PersistenceComponent, RouteComponent};
pub use error::{Funneled, RequestError, GENERIC_ERROR_MESSAGE};
pub use mail::{EmailRequest, MailClient, Mailer};
pub use module::Module;
pub use orchestrator::{Orchestrator, OrchestratorError, RunningService};
pub use persistence::{Db, DbHandle, PersistenceInit, SchemaBuilder};
pub use registry::{Family, Registrator, Registry, RegistryBuilder, RegistryError, RouteComponentInit};
pub use route::{
    Operation, RouteComponentBase, RouteComponentConfig, RouteDescriptor, RoutePath, TaskHandler, TaskInput,
};
pub use runner::{run, RunOptions, ShutdownOptions};
pub use services::Collaborators;
pub use session::Session;
pub use settings::ModuleSettings;
pub use store::GeneralStore;
pub use token::{Claims, TokenManager};

/// Register a persistence component factory under `name`.
#[macro_export]
macro_rules! register_persistence {
    ($name:literal, $factory:path $(,)?) => {
        const _: () = {
            fn __register(b: &mut $crate::registry::RegistryBuilder) {
                b.register_persistence($name, $factory);
            }
            $crate::inventory::submit! {
                $crate::registry::Registrator(__register)
            }
        };
    };
}

/// Register a client module, optionally with a settings override function.
#[macro_export]
macro_rules! register_client_module {
    ($name:literal $(,)?) => {
        $crate::__register_module!($crate::registry::Family::Client, $name, None);
    };
    ($name:literal, settings = $settings:path $(,)?) => {
        $crate::__register_module!($crate::registry::Family::Client, $name, Some($settings));
    };
}

/// Register an api module, optionally with a settings override function.
#[macro_export]
macro_rules! register_api_module {
    ($name:literal $(,)?) => {
        $crate::__register_module!($crate::registry::Family::Api, $name, None);
    };
    ($name:literal, settings = $settings:path $(,)?) => {
        $crate::__register_module!($crate::registry::Family::Api, $name, Some($settings));
    };
}

/// Register a route component factory in a client module.
#[macro_export]
macro_rules! register_client_component {
    ($module:literal, $name:literal, $factory:path $(,)?) => {
        $crate::__register_component!($crate::registry::Family::Client, $module, $name, $factory);
    };
}

/// Register a route component factory in an api module.
#[macro_export]
macro_rules! register_api_component {
    ($module:literal, $name:literal, $factory:path $(,)?) => {
        $crate::__register_component!($crate::registry::Family::Api, $module, $name, $factory);
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __register_module {
    ($family:expr, $name:literal, $settings:expr) => {
        const _: () = {
            fn __register(b: &mut $crate::registry::RegistryBuilder) {
                let settings: ::std::option::Option<$crate::registry::SettingsOverride> = $settings;
                b.register_module($family, $name, settings);
            }
            $crate::inventory::submit! {
                $crate::registry::Registrator(__register)
            }
        };
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __register_component {
    ($family:expr, $module:literal, $name:literal, $factory:path) => {
        const _: () = {
            fn __register(b: &mut $crate::registry::RegistryBuilder) {
                b.register_route_component($family, $module, $name, $factory);
            }
            $crate::inventory::submit! {
                $crate::registry::Registrator(__register)
            }
        };
    };
}

#[cfg(test)]
mod tests;
