use crate::error::{AppError, Result};
use crate::models::IdempotencyResource;
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence contract for idempotency resources.
///
/// `create` must be atomic: of two concurrent creations for one key exactly
/// one succeeds, the other fails with [`AppError::DuplicateKey`]. Writes
/// replace the whole resource.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyResource>>;

    async fn create(&self, resource: &IdempotencyResource) -> Result<()>;

    async fn update(&self, resource: &IdempotencyResource) -> Result<()>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Stores that can drop expired records on demand.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    async fn purge_expired(&self) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    resource: IdempotencyResource,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Single-process store. Creation is atomic under the write lock.
#[derive(Clone, Default)]
pub struct InMemoryResourceStore {
    data: Arc<RwLock<HashMap<String, StoredEntry>>>,
    ttl_seconds: Option<i64>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries become invisible `ttl_seconds` after creation.
    pub fn with_ttl(ttl_seconds: i64) -> Self {
        Self {
            data: Arc::default(),
            ttl_seconds: Some(ttl_seconds),
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl_seconds.map(|ttl| now + Duration::seconds(ttl))
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let map = self.data.read().await;
        map.values().filter(|entry| !entry.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyResource>> {
        let now = Utc::now();
        let map = self.data.read().await;
        Ok(map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.resource.clone()))
    }

    async fn create(&self, resource: &IdempotencyResource) -> Result<()> {
        let now = Utc::now();
        let mut map = self.data.write().await;
        if let Some(existing) = map.get(&resource.idempotency_key) {
            if !existing.is_expired(now) {
                return Err(AppError::DuplicateKey(resource.idempotency_key.clone()));
            }
        }
        map.insert(
            resource.idempotency_key.clone(),
            StoredEntry {
                resource: resource.clone(),
                expires_at: self.expiry_from(now),
            },
        );
        Ok(())
    }

    async fn update(&self, resource: &IdempotencyResource) -> Result<()> {
        let mut map = self.data.write().await;
        match map.get_mut(&resource.idempotency_key) {
            Some(entry) => {
                entry.resource = resource.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!(
                "Idempotency resource {} not found",
                resource.idempotency_key
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.data.write().await;
        map.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ExpiringStore for InMemoryResourceStore {
    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut map = self.data.write().await;
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        Ok((before - map.len()) as u64)
    }
}

/// Redis-backed store; one JSON document per key.
pub struct RedisResourceStore {
    client: redis::Client,
    key_prefix: String,
    ttl_seconds: i64,
}

impl RedisResourceStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            ttl_seconds,
        }
    }

    fn make_key(&self, idempotency_key: &str) -> String {
        format!("{}:{}", self.key_prefix, idempotency_key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    /// `EX` must be positive; a non-positive TTL keeps keys for one second.
    fn expiry_seconds(&self) -> usize {
        usize::try_from(self.ttl_seconds.max(1)).unwrap_or(1)
    }

    fn set_options(&self, check: redis::ExistenceCheck) -> redis::SetOptions {
        redis::SetOptions::default()
            .conditional_set(check)
            .with_expiration(redis::SetExpiry::EX(self.expiry_seconds()))
    }

    fn record<T>(&self, operation: &str, timer: LatencyTimer, result: &Result<T>) {
        get_metrics().record_store_operation("redis", operation, timer.elapsed_ms(), result.is_ok());
    }

    async fn find_inner(&self, key: &str) -> Result<Option<IdempotencyResource>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.make_key(key)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn create_inner(&self, resource: &IdempotencyResource) -> Result<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(resource)?;
        let set: Option<String> = conn
            .set_options(
                self.make_key(&resource.idempotency_key),
                json,
                self.set_options(redis::ExistenceCheck::NX),
            )
            .await?;

        match set {
            Some(_) => Ok(()),
            None => Err(AppError::DuplicateKey(resource.idempotency_key.clone())),
        }
    }

    async fn update_inner(&self, resource: &IdempotencyResource) -> Result<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(resource)?;
        let set: Option<String> = conn
            .set_options(
                self.make_key(&resource.idempotency_key),
                json,
                self.set_options(redis::ExistenceCheck::XX),
            )
            .await?;

        match set {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!(
                "Idempotency resource {} not found",
                resource.idempotency_key
            ))),
        }
    }

    async fn delete_inner(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(self.make_key(key)).await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for RedisResourceStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyResource>> {
        let timer = LatencyTimer::new();
        let result = self.find_inner(key).await;
        self.record("find", timer, &result);
        result
    }

    async fn create(&self, resource: &IdempotencyResource) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.create_inner(resource).await;
        self.record("create", timer, &result);
        result
    }

    async fn update(&self, resource: &IdempotencyResource) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.update_inner(resource).await;
        self.record("update", timer, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.delete_inner(key).await;
        self.record("delete", timer, &result);
        result
    }
}

/// PostgreSQL-backed store. The resource is kept as a JSONB document.
pub struct PostgresResourceStore {
    pool: PgPool,
    ttl_seconds: i64,
}

impl PostgresResourceStore {
    pub fn new(pool: PgPool, ttl_seconds: i64) -> Self {
        Self { pool, ttl_seconds }
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to run migrations: {}", e)))
    }

    fn record<T>(&self, operation: &str, timer: LatencyTimer, result: &Result<T>) {
        get_metrics().record_store_operation("postgres", operation, timer.elapsed_ms(), result.is_ok());
    }
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyResource>> {
        let timer = LatencyTimer::new();
        let row: std::result::Result<Option<(serde_json::Value,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT document
            FROM idempotency_resources
            WHERE idempotency_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await;

        let result = match row {
            Ok(Some((document,))) => serde_json::from_value(document).map(Some).map_err(AppError::from),
            Ok(None) => Ok(None),
            Err(e) => Err(AppError::Database(e)),
        };
        self.record("find", timer, &result);
        result
    }

    async fn create(&self, resource: &IdempotencyResource) -> Result<()> {
        let timer = LatencyTimer::new();
        let document = serde_json::to_value(resource)?;

        // An expired row for the same key is replaced; a live one is kept.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_resources (idempotency_key, document, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET document = EXCLUDED.document,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_resources.expires_at <= NOW()
            "#,
        )
        .bind(&resource.idempotency_key)
        .bind(document)
        .bind(resource.created_at)
        .bind(resource.expires_at(self.ttl_seconds))
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)
        .and_then(|done| {
            if done.rows_affected() == 1 {
                Ok(())
            } else {
                Err(AppError::DuplicateKey(resource.idempotency_key.clone()))
            }
        });

        self.record("create", timer, &result);
        result
    }

    async fn update(&self, resource: &IdempotencyResource) -> Result<()> {
        let timer = LatencyTimer::new();
        let document = serde_json::to_value(resource)?;

        let result = sqlx::query(
            r#"
            UPDATE idempotency_resources
            SET document = $2
            WHERE idempotency_key = $1
            "#,
        )
        .bind(&resource.idempotency_key)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)
        .and_then(|done| {
            if done.rows_affected() == 1 {
                Ok(())
            } else {
                Err(AppError::NotFound(format!(
                    "Idempotency resource {} not found",
                    resource.idempotency_key
                )))
            }
        });

        self.record("update", timer, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_resources
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(AppError::Database);

        self.record("delete", timer, &result);
        result
    }
}

#[async_trait]
impl ExpiringStore for PostgresResourceStore {
    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_resources
            WHERE expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
