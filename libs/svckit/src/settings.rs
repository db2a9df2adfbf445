use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::Family;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotFoundRedirects {
    pub default: String,
    pub authenticated: String,
}

impl Default for NotFoundRedirects {
    fn default() -> Self {
        Self {
            default: "/".to_string(),
            authenticated: "/".to_string(),
        }
    }
}

/// Per-module settings visible to components and pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// Paths reachable without authentication.
    #[serde(default)]
    pub anonymous_access_routes: Vec<String>,
    /// Where unauthenticated client requests go; `None` disables the redirect.
    #[serde(default)]
    pub unauthorized_redirect_route: Option<String>,
    #[serde(default)]
    pub not_found_redirect_routes: NotFoundRedirects,
    /// Anything else the module's components read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModuleSettings {
    pub fn family_defaults(family: Family) -> Value {
        match family {
            Family::Client => serde_json::json!({
                "anonymous_access_routes": [],
                "unauthorized_redirect_route": null,
                "not_found_redirect_routes": { "default": "/", "authenticated": "/" },
            }),
            Family::Api => serde_json::json!({
                "anonymous_access_routes": [],
            }),
        }
    }

    /// Family defaults, then the registered override, then the config file.
    ///
    /// Each layer replaces whole top-level keys of the one before it.
    pub fn resolve(
        family: Family,
        registered: Option<&Value>,
        configured: Option<&Value>,
    ) -> Result<Self, serde_json::Error> {
        let mut merged = match Self::family_defaults(family) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for layer in [registered, configured].into_iter().flatten() {
            if let Value::Object(map) = layer {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        serde_json::from_value(Value::Object(merged))
    }

    pub fn allows_anonymous(&self, path: &str) -> bool {
        self.anonymous_access_routes.iter().any(|p| p == path)
    }

    /// Typed view of one `extra` key.
    pub fn extra_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.extra.get(key)?;
        match serde_json::from_value(raw.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "module setting has an unexpected shape");
                None
            }
        }
    }
}
