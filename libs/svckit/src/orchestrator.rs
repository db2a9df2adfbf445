//! Process orchestration: persistence wiring, module loading and bootstrap.
//!
//! Phase order: validate → collaborators → storage pool → instantiate
//! persistence → associate → set_db → schema sync → load modules. Any failure
//! aborts [`Orchestrator::build`]; nothing is bound until [`Orchestrator::listen`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use svckit_bootstrap::{AppConfig, ConfigError, DatabaseConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::contracts::ComponentMap;
use crate::module::{Module, ModuleError};
use crate::persistence::{self, Db, PersistenceInit, SchemaBuilder, SchemaError, WiringError};
use crate::registry::{Family, Registry, RegistryError};
use crate::service::{build_api_router, build_client_router, ServiceDeps, ServiceError};
use crate::services::Collaborators;
use crate::store::StoreError;
use crate::template::{self, TemplateError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("failed to initialize the general store")]
    Store(#[from] StoreError),
    #[error("failed to connect to the database")]
    Database(#[source] sqlx::Error),
    #[error("failed to instantiate persistence component '{component}'")]
    Instantiate {
        component: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Wiring(#[from] WiringError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("{family} module '{module}' has no server configuration")]
    MissingServerConfig { module: String, family: Family },
    #[error("no {family} module named '{module}'")]
    UnknownModule { module: String, family: Family },
    #[error("failed to render the shell page of client module '{module}'")]
    Shell {
        module: String,
        #[source]
        source: TemplateError,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{family} module '{module}' cannot bind {addr}")]
    Bind {
        module: String,
        family: Family,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A bound and serving module.
#[derive(Debug)]
pub struct RunningService {
    pub module: String,
    pub family: Family,
    pub local_addr: SocketAddr,
    pub handle: JoinHandle<std::io::Result<()>>,
}

/// Fully wired process state. Services start only on [`Orchestrator::listen`].
pub struct Orchestrator {
    config: Arc<AppConfig>,
    db: Arc<Db>,
    services: Collaborators,
    clients: BTreeMap<String, Module>,
    apis: BTreeMap<String, Module>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("db", &self.db)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("apis", &self.apis.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build with collaborators created from `config` (store, mail, tokens).
    pub async fn build(config: AppConfig, registry: &Registry) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let services = Collaborators::from_config(&config).await?;
        Self::build_with(config, registry, services).await
    }

    /// Build with caller-supplied collaborators.
    pub async fn build_with(
        config: AppConfig,
        registry: &Registry,
        services: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = connect_pool(config.database.as_ref()).await?;

        let mut schema = SchemaBuilder::default();
        let mut components = ComponentMap::new();
        for (name, factory) in registry.persistence() {
            let init = PersistenceInit {
                name: name.to_string(),
                pool: pool.clone(),
                services: services.clone(),
                config: config.clone(),
            };
            let component = factory(&mut schema, &init).map_err(|source| OrchestratorError::Instantiate {
                component: name.to_string(),
                source,
            })?;
            components.insert(name.to_string(), component);
        }
        tracing::info!(count = components.len(), "persistence components instantiated");

        let db = persistence::wire(components, pool)?;
        let log_statements = config.database.as_ref().is_some_and(|d| d.log_statements);
        schema.sync(db.pool(), log_statements).await?;

        let clients = load_family(registry, Family::Client, &config)?;
        let apis = load_family(registry, Family::Api, &config)?;
        for name in config.modules.keys() {
            if !clients.contains_key(name) && !apis.contains_key(name) {
                tracing::warn!(module = %name, "settings configured for an unregistered module");
            }
        }
        tracing::info!(clients = clients.len(), apis = apis.len(), "modules loaded");

        Ok(Self {
            config,
            db,
            services,
            clients,
            apis,
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn services(&self) -> &Collaborators {
        &self.services
    }

    pub fn module(&self, family: Family, name: &str) -> Option<&Module> {
        match family {
            Family::Client => self.clients.get(name),
            Family::Api => self.apis.get(name),
        }
    }

    pub fn modules(&self, family: Family) -> impl Iterator<Item = &Module> + '_ {
        match family {
            Family::Client => self.clients.values(),
            Family::Api => self.apis.values(),
        }
    }

    fn deps(&self) -> ServiceDeps {
        ServiceDeps {
            db: self.db.clone(),
            services: self.services.clone(),
            config: self.config.clone(),
        }
    }

    fn require(&self, family: Family, name: &str) -> Result<&Module, OrchestratorError> {
        self.module(family, name).ok_or_else(|| OrchestratorError::UnknownModule {
            module: name.to_string(),
            family,
        })
    }

    fn missing_config(family: Family, name: &str) -> OrchestratorError {
        OrchestratorError::MissingServerConfig {
            module: name.to_string(),
            family,
        }
    }

    /// The client service without binding it; the shell page is not rendered.
    pub fn client_router(&self, name: &str) -> Result<Router, OrchestratorError> {
        let module = self.require(Family::Client, name)?;
        let cfg = self
            .config
            .clients
            .get(name)
            .ok_or_else(|| Self::missing_config(Family::Client, name))?;
        let public_dir = self.config.resolve_path(&cfg.public_path);
        Ok(build_client_router(module, &self.deps(), cfg, &public_dir)?)
    }

    /// The api service without binding it.
    pub fn api_router(&self, name: &str) -> Result<Router, OrchestratorError> {
        let module = self.require(Family::Api, name)?;
        let cfg = self
            .config
            .apis
            .get(name)
            .ok_or_else(|| Self::missing_config(Family::Api, name))?;
        Ok(build_api_router(module, &self.deps(), cfg)?)
    }

    fn render_shell(&self, name: &str) -> Result<(), OrchestratorError> {
        let cfg = self
            .config
            .clients
            .get(name)
            .ok_or_else(|| Self::missing_config(Family::Client, name))?;
        let sources = self.config.resolve_path(&self.config.server.client_sources_dir).join(name);
        let public = self.config.resolve_path(&cfg.public_path);
        let written = template::render_shell(&sources, &public, name, &self.config.server.profile).map_err(|source| {
            OrchestratorError::Shell {
                module: name.to_string(),
                source,
            }
        })?;
        tracing::debug!(module = name, path = %written.display(), "shell page rendered");
        Ok(())
    }

    /// Render shell pages, build every service and bind every listener, then
    /// start serving. Services stop gracefully when `cancel` fires.
    pub async fn listen(&self, cancel: CancellationToken) -> Result<Vec<RunningService>, OrchestratorError> {
        let mut pending: Vec<(String, Family, u16, Router)> = Vec::new();
        for (name, cfg) in self.clients.keys().filter_map(|n| self.config.clients.get(n).map(|c| (n, c))) {
            self.render_shell(name)?;
            pending.push((name.clone(), Family::Client, cfg.port, self.client_router(name)?));
        }
        for (name, cfg) in self.apis.keys().filter_map(|n| self.config.apis.get(n).map(|c| (n, c))) {
            pending.push((name.clone(), Family::Api, cfg.port, self.api_router(name)?));
        }

        let host = self.config.server.host.as_str();
        let mut bound = Vec::with_capacity(pending.len());
        for (module, family, port, router) in pending {
            let addr = format!("{host}:{port}");
            let bind_err = |source| OrchestratorError::Bind {
                module: module.clone(),
                family,
                addr: addr.clone(),
                source,
            };
            let listener = TcpListener::bind((host, port)).await.map_err(bind_err)?;
            let local_addr = listener.local_addr().map_err(bind_err)?;
            bound.push((module, family, listener, local_addr, router));
        }

        let mut running = Vec::with_capacity(bound.len());
        for (module, family, listener, local_addr, router) in bound {
            tracing::info!(module = %module, %family, %local_addr, "service listening");
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
            });
            running.push(RunningService {
                module,
                family,
                local_addr,
                handle,
            });
        }
        Ok(running)
    }
}

async fn connect_pool(cfg: Option<&DatabaseConfig>) -> Result<Option<AnyPool>, OrchestratorError> {
    let Some(cfg) = cfg else {
        tracing::info!("no database configured; persistence runs without storage");
        return Ok(None);
    };
    sqlx::any::install_default_drivers();
    let mut options = AnyPoolOptions::new();
    if let Some(max) = cfg.max_conns {
        options = options.max_connections(max);
    }
    let pool = options.connect(&cfg.url).await.map_err(OrchestratorError::Database)?;
    tracing::info!("database pool ready");
    Ok(Some(pool))
}

fn load_family(
    registry: &Registry,
    family: Family,
    config: &AppConfig,
) -> Result<BTreeMap<String, Module>, OrchestratorError> {
    let mut out = BTreeMap::new();
    for entry in registry.modules(family) {
        let has_server = match family {
            Family::Client => config.clients.contains_key(entry.name),
            Family::Api => config.apis.contains_key(entry.name),
        };
        if !has_server {
            return Err(Orchestrator::missing_config(family, entry.name));
        }
        let module = Module::load(entry, config.modules.get(entry.name))?;
        out.insert(entry.name.to_string(), module);
    }
    Ok(out)
}
