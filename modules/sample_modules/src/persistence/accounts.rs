//! `accounts`: people who can sign in to the sample modules.
//!
//! Records live in the `accounts` table when a database is configured and in
//! memory otherwise. Password hashes never leave this component.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwapOption;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use dashmap::DashMap;
use http::StatusCode;
use serde_json::{json, Map, Value};
use sqlx::AnyPool;
use svckit::mail::EmailRequest;
use svckit::{DbHandle, Filter, Mailer, PersistenceComponent, PersistenceInit, RequestError, SchemaBuilder};

use super::{id_of, matches};

pub const NAME: &str = "accounts";

const PASSWORD_HASH: &str = "password_hash";

enum Records {
    Memory {
        rows: DashMap<i64, Map<String, Value>>,
        next_id: AtomicI64,
    },
    Sql(AnyPool),
}

fn storage_err(e: sqlx::Error) -> RequestError {
    RequestError::new(anyhow::Error::new(e).context("accounts storage"))
}

fn decode_doc(raw: &str) -> Result<Map<String, Value>, RequestError> {
    serde_json::from_str(raw).map_err(|e| RequestError::new(anyhow::Error::new(e).context("corrupt account record")))
}

impl Records {
    async fn insert(&self, doc: &Map<String, Value>) -> Result<i64, RequestError> {
        match self {
            Records::Memory { rows, next_id } => {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                rows.insert(id, doc.clone());
                Ok(id)
            }
            Records::Sql(pool) => sqlx::query_scalar::<_, i64>("INSERT INTO accounts (doc) VALUES ($1) RETURNING id")
                .bind(Value::Object(doc.clone()).to_string())
                .fetch_one(pool)
                .await
                .map_err(storage_err),
        }
    }

    /// Every record in id order, with `id` filled in.
    async fn all(&self) -> Result<Vec<Map<String, Value>>, RequestError> {
        let mut out: Vec<(i64, Map<String, Value>)> = match self {
            Records::Memory { rows, .. } => rows.iter().map(|r| (*r.key(), r.value().clone())).collect(),
            Records::Sql(pool) => {
                let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, doc FROM accounts ORDER BY id")
                    .fetch_all(pool)
                    .await
                    .map_err(storage_err)?;
                let mut out = Vec::with_capacity(rows.len());
                for (id, doc) in rows {
                    out.push((id, decode_doc(&doc)?));
                }
                out
            }
        };
        out.sort_by_key(|(id, _)| *id);
        Ok(out
            .into_iter()
            .map(|(id, mut doc)| {
                doc.insert("id".into(), json!(id));
                doc
            })
            .collect())
    }

    async fn put(&self, id: i64, doc: &Map<String, Value>) -> Result<bool, RequestError> {
        match self {
            Records::Memory { rows, .. } => match rows.get_mut(&id) {
                Some(mut row) => {
                    *row = doc.clone();
                    Ok(true)
                }
                None => Ok(false),
            },
            Records::Sql(pool) => {
                let res = sqlx::query("UPDATE accounts SET doc = $1 WHERE id = $2")
                    .bind(Value::Object(doc.clone()).to_string())
                    .bind(id)
                    .execute(pool)
                    .await
                    .map_err(storage_err)?;
                Ok(res.rows_affected() > 0)
            }
        }
    }

    async fn remove(&self, id: i64) -> Result<bool, RequestError> {
        match self {
            Records::Memory { rows, .. } => Ok(rows.remove(&id).is_some()),
            Records::Sql(pool) => {
                let res = sqlx::query("DELETE FROM accounts WHERE id = $1")
                    .bind(id)
                    .execute(pool)
                    .await
                    .map_err(storage_err)?;
                Ok(res.rows_affected() > 0)
            }
        }
    }
}

pub struct Accounts {
    records: Records,
    mailer: Mailer,
    db: ArcSwapOption<DbHandle>,
    /// Serialises the duplicate-email check with the insert that follows it.
    /// Only guards this process; a shared database needs a unique index.
    create_lock: tokio::sync::Mutex<()>,
}

/// Drop the password hash and anything else callers must not see.
fn public_view(mut doc: Map<String, Value>) -> Value {
    doc.remove(PASSWORD_HASH);
    Value::Object(doc)
}

fn not_found() -> RequestError {
    RequestError::safe(StatusCode::NOT_FOUND, "Account not found.")
}

fn invalid_credentials() -> RequestError {
    RequestError::safe(StatusCode::UNAUTHORIZED, "Invalid email or password.")
}

async fn hash_password(password: String) -> Result<String, RequestError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))
    })
    .await
    .context("password hashing task failed")
    .and_then(|r| r)
    .map_err(RequestError::new)
}

impl Accounts {
    pub fn in_memory(mailer: Mailer) -> Self {
        Self {
            records: Records::Memory {
                rows: DashMap::new(),
                next_id: AtomicI64::new(1),
            },
            mailer,
            db: ArcSwapOption::empty(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_pool(pool: AnyPool, mailer: Mailer) -> Self {
        Self {
            records: Records::Sql(pool),
            mailer,
            db: ArcSwapOption::empty(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn find(&self, filter: &Filter) -> Result<Option<Map<String, Value>>, RequestError> {
        Ok(self.records.all().await?.into_iter().find(|doc| matches(filter, doc)))
    }

    /// The public account for `email` when `password` matches its hash.
    pub async fn verify_credentials(&self, email: &str, password: &str) -> Result<Value, RequestError> {
        let mut filter = Filter::new();
        filter.insert("email".into(), json!(email));
        let Some(doc) = self.find(&filter).await? else {
            return Err(invalid_credentials());
        };
        let Some(stored) = doc.get(PASSWORD_HASH).and_then(Value::as_str).map(str::to_string) else {
            return Err(invalid_credentials());
        };

        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            PasswordHash::new(&stored)
                .map(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
                .unwrap_or(false)
        })
        .await
        .map_err(|e| RequestError::new(anyhow::Error::new(e).context("password check task failed")))?;

        if !verified {
            return Err(invalid_credentials());
        }
        Ok(public_view(doc))
    }

    async fn grant_default_role(&self, id: i64) -> Result<(), RequestError> {
        let Some(roles) = self.db.load_full().and_then(|db| db.component(super::roles::NAME)) else {
            return Ok(());
        };
        roles.create(json!({ "account_id": id, "role": "member" })).await?;
        Ok(())
    }

    async fn send_welcome(&self, account: &Value) {
        let Some(email) = account.get("email").and_then(Value::as_str) else {
            return;
        };
        let req = EmailRequest {
            to: vec![email.to_string()],
            subject: "Welcome".to_string(),
            template_name: "welcome".to_string(),
            fields: account.clone(),
        };
        if let Err(e) = self.mailer.send_email(req).await {
            tracing::warn!(error = %e, %email, "welcome mail not sent");
        }
    }
}

#[async_trait]
impl PersistenceComponent for Accounts {
    fn name(&self) -> &str {
        NAME
    }

    fn set_db(&self, db: DbHandle) -> anyhow::Result<()> {
        self.db.store(Some(Arc::new(db)));
        Ok(())
    }

    async fn create(&self, body: Value) -> Result<Value, RequestError> {
        let Value::Object(mut doc) = body else {
            return Err(RequestError::bad_request("Expected an account object."));
        };
        doc.remove("id");
        doc.remove(PASSWORD_HASH);

        let email = doc
            .get("email")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| RequestError::bad_request("An email address is required."))?
            .to_string();
        if let Some(password) = doc.remove("password") {
            let password = password
                .as_str()
                .filter(|p| p.len() >= 8)
                .ok_or_else(|| RequestError::bad_request("Passwords need at least 8 characters."))?
                .to_string();
            doc.insert(PASSWORD_HASH.into(), json!(hash_password(password).await?));
        }

        let guard = self.create_lock.lock().await;
        let mut by_email = Filter::new();
        by_email.insert("email".into(), json!(email));
        if self.find(&by_email).await?.is_some() {
            return Err(RequestError::safe(StatusCode::CONFLICT, "Email already registered."));
        }

        let id = self.records.insert(&doc).await?;
        doc.insert("id".into(), json!(id));

        // an account without its role is unusable; undo the insert
        if let Err(e) = self.grant_default_role(id).await {
            if let Err(undo) = self.records.remove(id).await {
                tracing::error!(account = id, error = ?undo, "failed to roll back account");
            }
            return Err(e);
        }
        drop(guard);
        tracing::info!(account = id, "account created");

        let account = public_view(doc);
        self.send_welcome(&account).await;
        Ok(account)
    }

    async fn read(&self, filter: Filter) -> Result<Value, RequestError> {
        self.find(&filter).await?.map(public_view).ok_or_else(not_found)
    }

    async fn read_list(&self, body: Value) -> Result<Value, RequestError> {
        let filter = match body {
            Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_object() && !v.is_array()).collect(),
            _ => Filter::new(),
        };
        let all = self.records.all().await?;
        Ok(Value::Array(
            all.into_iter()
                .filter(|doc| matches(&filter, doc))
                .map(public_view)
                .collect(),
        ))
    }

    async fn update(&self, body: Value) -> Result<Value, RequestError> {
        let Value::Object(changes) = body else {
            return Err(RequestError::bad_request("Expected an account object."));
        };
        let id = changes
            .get("id")
            .and_then(id_of)
            .ok_or_else(|| RequestError::bad_request("An account id is required."))?;

        let mut by_id = Filter::new();
        by_id.insert("id".into(), json!(id));
        let mut doc = self.find(&by_id).await?.ok_or_else(not_found)?;

        for (key, value) in changes {
            match key.as_str() {
                "id" | PASSWORD_HASH => {}
                "password" => {
                    let password = value
                        .as_str()
                        .filter(|p| p.len() >= 8)
                        .ok_or_else(|| RequestError::bad_request("Passwords need at least 8 characters."))?
                        .to_string();
                    doc.insert(PASSWORD_HASH.into(), json!(hash_password(password).await?));
                }
                _ => {
                    doc.insert(key, value);
                }
            }
        }

        doc.remove("id");
        if !self.records.put(id, &doc).await? {
            return Err(not_found());
        }
        doc.insert("id".into(), json!(id));
        Ok(public_view(doc))
    }

    async fn delete(&self, filter: Filter) -> Result<Value, RequestError> {
        let id = filter
            .get("id")
            .and_then(id_of)
            .ok_or_else(|| RequestError::bad_request("An account id is required."))?;
        if !self.records.remove(id).await? {
            return Err(not_found());
        }
        if let Some(roles) = self.db.load_full().and_then(|db| db.component(super::roles::NAME)) {
            let mut by_account = Filter::new();
            by_account.insert("account_id".into(), json!(id));
            roles.delete(by_account).await?;
        }
        Ok(json!({ "id": id, "deleted": true }))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn ddl(config: &svckit::bootstrap::AppConfig) -> &'static str {
    let postgres = config
        .database
        .as_ref()
        .is_some_and(|d| d.url.starts_with("postgres"));
    if postgres {
        "CREATE TABLE IF NOT EXISTS accounts (id BIGSERIAL PRIMARY KEY, doc TEXT NOT NULL)"
    } else {
        "CREATE TABLE IF NOT EXISTS accounts (id INTEGER PRIMARY KEY AUTOINCREMENT, doc TEXT NOT NULL)"
    }
}

pub fn factory(schema: &mut SchemaBuilder, init: &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>> {
    let mailer = init.services.mailer.clone();
    let component = match &init.pool {
        Some(pool) => {
            schema.add(NAME, ddl(&init.config));
            Accounts::with_pool(pool.clone(), mailer)
        }
        None => Accounts::in_memory(mailer),
    };
    Ok(Arc::new(component))
}
