//! Sample units for the svckit host: an `accounts`/`roles` persistence pair,
//! the `site` client module and the `mobile` api module.
//!
//! Linking this crate is enough to register everything below.

pub mod mobile;
pub mod persistence;
pub mod site;

mod routes;

svckit::register_persistence!("accounts", persistence::accounts::factory);
svckit::register_persistence!("roles", persistence::roles::factory);

svckit::register_client_module!("site", settings = site::settings);
svckit::register_client_component!("site", "accounts", site::accounts_routes);
svckit::register_client_component!("site", "session", site::session_routes);

svckit::register_api_module!("mobile", settings = mobile::settings);
svckit::register_api_component!("mobile", "accounts", mobile::accounts_routes);
svckit::register_api_component!("mobile", "roles", mobile::roles_routes);
svckit::register_api_component!("mobile", "auth", mobile::auth_routes);
