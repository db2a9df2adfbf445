//! Cookie parsing and server-side sessions for client services.
//!
//! The session id travels in a signed, `HttpOnly` cookie; the record lives in
//! the general store under `sess:{id}` and is saved after every request.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use cookie::{Cookie, CookieJar, Key};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::store::GeneralStore;

/// Session key holding the logged-in user.
pub const USER_KEY: &str = "user";

/// Cookies sent with the request.
#[derive(Clone, Debug, Default)]
pub struct RequestCookies(pub CookieJar);

impl RequestCookies {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|c| c.value())
    }
}

pub async fn parse_cookies(mut req: Request, next: Next) -> Response {
    let mut jar = CookieJar::new();
    for header in req.headers().get_all(COOKIE) {
        let Ok(raw) = header.to_str() else {
            continue;
        };
        for cookie in Cookie::split_parse_encoded(raw.to_owned()).flatten() {
            jar.add_original(cookie.into_owned());
        }
    }
    req.extensions_mut().insert(RequestCookies(jar));
    next.run(req).await
}

struct SessionInner {
    id: String,
    is_new: bool,
    data: Mutex<Map<String, Value>>,
}

/// Handle to the current request's session; clones share state.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl Session {
    fn new(id: String, is_new: bool, data: Map<String, Value>) -> Self {
        Self(Arc::new(SessionInner {
            id,
            is_new,
            data: Mutex::new(data),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn is_new(&self) -> bool {
        self.0.is_new
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.data.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0.data.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.data.lock().remove(key)
    }

    pub fn user(&self) -> Option<Value> {
        self.get(USER_KEY).filter(|u| !u.is_null())
    }

    /// Mark the session as authenticated for subsequent requests.
    pub fn login(&self, user: Value) {
        self.insert(USER_KEY, user);
    }

    pub fn logout(&self) {
        self.remove(USER_KEY);
    }

    fn snapshot(&self) -> Value {
        Value::Object(self.0.data.lock().clone())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("is_new", &self.0.is_new)
            .finish_non_exhaustive()
    }
}

/// Per-module session settings.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn GeneralStore>,
    key: Key,
    cookie_name: String,
    ttl: Duration,
}

impl SessionManager {
    /// `secret` must be at least 32 bytes; the signing key is derived from it.
    pub fn new(
        store: Arc<dyn GeneralStore>,
        secret: &str,
        cookie_name: impl Into<String>,
        ttl: Duration,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            secret.len() >= svckit_bootstrap::MIN_SESSION_SECRET_LEN,
            "session secret must be at least {} bytes",
            svckit_bootstrap::MIN_SESSION_SECRET_LEN
        );
        Ok(Self {
            store,
            key: Key::derive_from(secret.as_bytes()),
            cookie_name: cookie_name.into(),
            ttl,
        })
    }

    fn record_key(id: &str) -> String {
        format!("sess:{id}")
    }

    async fn load(&self, cookies: Option<&RequestCookies>) -> Session {
        let id = cookies.and_then(|c| {
            c.0.signed(&self.key)
                .get(&self.cookie_name)
                .map(|c| c.value().to_string())
        });

        if let Some(id) = id {
            match self.store.get_json(&Self::record_key(&id)).await {
                Ok(Some(Value::Object(data))) => return Session::new(id, false, data),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to load session; starting a new one"),
            }
        }
        Session::new(uuid::Uuid::new_v4().to_string(), true, Map::new())
    }

    async fn save(&self, session: &Session) {
        let key = Self::record_key(session.id());
        if let Err(e) = self.store.set_json(&key, &session.snapshot(), Some(self.ttl)).await {
            tracing::error!(error = %e, session = %session.id(), "failed to save session");
        }
    }

    /// `Set-Cookie` value carrying the signed session id.
    pub fn cookie_header(&self, session_id: &str) -> Option<HeaderValue> {
        let mut jar = CookieJar::new();
        jar.signed_mut(&self.key).add(
            Cookie::build((self.cookie_name.clone(), session_id.to_string()))
                .http_only(true)
                .path("/"),
        );
        let cookie = jar.delta().next()?;
        HeaderValue::from_str(&cookie.encoded().to_string()).ok()
    }
}

/// Load (or start) the session, run the request, then persist the session.
pub async fn session_stage(
    State(manager): State<Arc<SessionManager>>,
    mut req: Request,
    next: Next,
) -> Response {
    let session = manager.load(req.extensions().get::<RequestCookies>()).await;
    req.extensions_mut().insert(session.clone());

    let mut res = next.run(req).await;

    manager.save(&session).await;
    if session.is_new() {
        if let Some(value) = manager.cookie_header(session.id()) {
            res.headers_mut().append(SET_COOKIE, value);
        }
    }
    res
}
