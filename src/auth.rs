//! Authentication Module
//!
//! Verifies the bearer credential on every chat-completion request:
//! - parses and validates the surface format of the token,
//! - hashes it with a configured salt and compares against the key store
//!   using a constant-time routine,
//! - falls back to a synthesized `dev-user` principal when no durable key
//!   store is configured,
//! - updates `last_used_at` as a fire-and-forget side effect on success.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::error::GatewayError;
use crate::types::Principal;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ApiKeyRecord {
    id: i64,
    user_id: String,
    key_hash: String,
    status: String,
}

/// Abstraction over the api_keys table so the authenticator is testable
/// without a database.
#[async_trait::async_trait]
trait KeyStore: Send + Sync {
    async fn find_by_prefix(&self, prefix: &str) -> anyhow::Result<Option<ApiKeyRecord>>;
    async fn touch_last_used(&self, id: i64);
}

struct PgKeyStore {
    pool: sqlx::PgPool,
}

#[async_trait::async_trait]
impl KeyStore for PgKeyStore {
    async fn find_by_prefix(&self, prefix: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        let row = sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, user_id, key_hash, status FROM api_keys WHERE key_prefix = $1",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_last_used(&self, id: i64) {
        if let Err(err) = sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %err, key_id = id, "failed to update api key last_used_at");
        }
    }
}

/// Compute `sha256(salt || ":" || token)`, hex-encoded.
pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Splits a bearer token into its `<prefix>_<rest>` parts and checks the
/// surface format: 2-10 alphanumeric prefix chars, an underscore, then at
/// least 16 alphanumeric characters.
fn validate_format(token: &str) -> Option<&str> {
    let (prefix, rest) = token.split_once('_')?;
    if !(2..=10).contains(&prefix.len()) || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if rest.len() < 16 || !rest.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(prefix)
}

#[derive(Clone)]
pub struct Authenticator {
    salt: String,
    store: Option<std::sync::Arc<dyn KeyStore>>,
}

impl Authenticator {
    pub fn new(config: &Config, pool: Option<sqlx::PgPool>) -> Self {
        let store: Option<std::sync::Arc<dyn KeyStore>> =
            pool.map(|p| std::sync::Arc::new(PgKeyStore { pool: p }) as std::sync::Arc<dyn KeyStore>);
        Self { salt: config.key_salt.clone(), store }
    }

    /// Parse, hash, and authorize the `Authorization` header value.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, GatewayError> {
        let header = authorization.ok_or(GatewayError::AuthMissing)?;
        let token = strip_bearer(header).ok_or(GatewayError::AuthMissing)?;
        let prefix = validate_format(token).ok_or(GatewayError::AuthBadFormat)?;

        let Some(store) = &self.store else {
            return Ok(Principal {
                user_id: "dev-user".to_string(),
                api_key_id: None,
                key_prefix: prefix.to_string(),
            });
        };

        let record = match store.find_by_prefix(prefix).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(GatewayError::AuthRevoked),
            Err(err) => {
                tracing::error!(error = %err, "key store lookup failed");
                return Err(GatewayError::Internal(err));
            }
        };

        let computed = hash_token(token, &self.salt);
        if !constant_time_eq(&computed, &record.key_hash) {
            return Err(GatewayError::AuthRevoked);
        }
        if record.status != "active" {
            return Err(GatewayError::AuthRevoked);
        }

        let key_id = record.id;
        let store = store.clone();
        tokio::spawn(async move {
            store.touch_last_used(key_id).await;
        });

        Ok(Principal {
            user_id: record.user_id,
            api_key_id: Some(record.id),
            key_prefix: prefix.to_string(),
        })
    }
}

fn strip_bearer(header: &str) -> Option<&str> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
