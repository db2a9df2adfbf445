use std::sync::Arc;
use std::time::Duration;

use svckit_bootstrap::AppConfig;

use crate::error::RequestError;
use crate::mail::Mailer;
use crate::persistence::Db;
use crate::registry::Family;
use crate::services::Collaborators;
use crate::settings::ModuleSettings;
use crate::store::GeneralStore;
use crate::token::TokenManager;

/// Per-request view of the process, seeded by the context stage for every
/// mounted path.
pub struct RequestContext {
    pub module_name: Arc<str>,
    pub family: Family,
    pub db: Arc<Db>,
    pub services: Collaborators,
    pub settings: Arc<ModuleSettings>,
    pub config: Arc<AppConfig>,
    /// Request path without the query string.
    pub original_url: String,
    /// Request-scoped logger.
    pub span: tracing::Span,
}

impl RequestContext {
    pub fn mailer(&self) -> &Mailer {
        &self.services.mailer
    }

    pub fn store(&self) -> &Arc<dyn GeneralStore> {
        &self.services.store
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.services.tokens
    }

    /// Sign a bearer token for the current api module with its configured
    /// secret and lifetime.
    pub fn issue_token(&self, subject: &str, data: serde_json::Value) -> Result<String, RequestError> {
        let jwt = self
            .config
            .apis
            .get(self.module_name.as_ref())
            .map(|api| &api.jwt)
            .ok_or_else(|| {
                RequestError::new(anyhow::anyhow!(
                    "module '{}' has no api configuration to sign tokens with",
                    self.module_name
                ))
            })?;
        self.tokens()
            .sign(&jwt.secret, &self.module_name, subject, data, Duration::from_secs(jwt.ttl_sec))
            .map_err(|e| RequestError::new(anyhow::Error::new(e)))
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("module_name", &self.module_name)
            .field("family", &self.family)
            .field("original_url", &self.original_url)
            .finish_non_exhaustive()
    }
}
