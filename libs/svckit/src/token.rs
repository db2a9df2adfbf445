//! HS256 bearer tokens with a revocation list kept in the general store.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::store::{GeneralStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Module the token was issued for.
    pub module: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token issued for module '{actual}', expected '{expected}'")]
    WrongModule { expected: String, actual: String },
    #[error("token has been revoked")]
    Revoked,
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn revoked_key(jti: &str) -> String {
    format!("revoked:{jti}")
}

/// Signs and validates module tokens. Secrets are per module and passed in.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn GeneralStore>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn GeneralStore>) -> Self {
        Self { store }
    }

    pub fn sign(
        &self,
        secret: &str,
        module: &str,
        subject: &str,
        data: serde_json::Value,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            module: module.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
            data,
        };
        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?)
    }

    /// Check signature, expiry, audience module and the revocation list.
    pub async fn validate(&self, secret: &str, module: &str, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let claims = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)?.claims;

        if claims.module != module {
            return Err(TokenError::WrongModule {
                expected: module.to_string(),
                actual: claims.module,
            });
        }
        if self.store.get(&revoked_key(&claims.jti)).await?.is_some() {
            return Err(TokenError::Revoked);
        }
        Ok(claims)
    }

    /// Reject `claims` from now until they would have expired anyway.
    pub async fn revoke(&self, claims: &Claims) -> Result<(), TokenError> {
        let remaining = (claims.exp - chrono::Utc::now().timestamp()).max(1) as u64;
        self.store
            .set(&revoked_key(&claims.jti), claims.sub.clone(), Some(Duration::from_secs(remaining)))
            .await?;
        Ok(())
    }
}
