use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::cache::{CacheBackend, CacheError, MAX_TTL_SECS};

pub async fn connect(database_url: &str) -> crate::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(3))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn init_db(pool: &PgPool) -> crate::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| crate::Error::Database(e.into()))?;
    Ok(())
}

/// Indicator cache stored in `cohort_indicators.cache_entries`.
#[derive(Debug, Clone)]
pub struct PgCache {
    pool: PgPool,
}

impl PgCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Escapes `LIKE` wildcards so keys containing `_` match literally.
fn like_prefix(prefix: &str) -> String {
    let prefix = prefix.strip_suffix('*').unwrap_or(prefix);
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl CacheBackend for PgCache {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let row = sqlx::query(
            r#"
            SELECT payload
            FROM cohort_indicators.cache_entries
            WHERE cache_key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("payload")))
    }

    async fn set(&self, key: &str, payload: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        let ttl = ttl_seconds.min(MAX_TTL_SECS) as i64;
        let expires_at = Utc::now() + Duration::seconds(ttl);

        sqlx::query(
            r#"
            INSERT INTO cohort_indicators.cache_entries (cache_key, payload, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (cache_key) DO UPDATE
            SET payload = EXCLUDED.payload,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cohort_indicators.cache_entries
            WHERE cache_key LIKE $1 ESCAPE '\'
            "#,
        )
        .bind(like_prefix(prefix))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
