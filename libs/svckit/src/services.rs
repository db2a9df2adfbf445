use std::sync::Arc;

use svckit_bootstrap::{AppConfig, StoreKind};

use crate::mail::Mailer;
use crate::store::{GeneralStore, MemoryStore, RedisStore, StoreError};
use crate::token::TokenManager;

/// Process-wide collaborators shared by persistence components and requests.
#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Mailer,
    pub store: Arc<dyn GeneralStore>,
    pub tokens: TokenManager,
}

impl Collaborators {
    pub fn new(mailer: Mailer, store: Arc<dyn GeneralStore>) -> Self {
        Self {
            tokens: TokenManager::new(store.clone()),
            mailer,
            store,
        }
    }

    pub async fn from_config(cfg: &AppConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn GeneralStore> = match cfg.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Redis => {
                let url = cfg.store.url.as_deref().unwrap_or("redis://127.0.0.1:6379");
                tracing::info!(%url, "connecting general store");
                Arc::new(RedisStore::connect(url).await?)
            }
        };
        let mailer = Mailer::from_config(&cfg.emails, cfg.resolve_path(&cfg.emails.templates_dir));
        Ok(Self::new(mailer, store))
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
