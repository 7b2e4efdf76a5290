//! Indicator cache coordination.
//!
//! Computed indicators are memoized under deterministic keys with a TTL. The
//! backing store is optional: every backend failure is logged and the
//! computation runs directly, so callers never see a cache error.
//!
//! Concurrent misses on the same key are not collapsed; each caller computes
//! and writes its own result.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalize::slug;
use crate::Result;

pub mod memory;

pub use memory::MemoryCache;

/// Namespace shared by every indicator key.
pub const KEY_NAMESPACE: &str = "indicators";

pub const TTL_SHORT_SECS: u64 = 300;
pub const TTL_MEDIUM_SECS: u64 = 3_600;
pub const TTL_LONG_SECS: u64 = 86_400;
pub const TTL_STUDENT_SECS: u64 = 900;

/// Ten years; backends clamp longer TTLs to this.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3_600;

/// Errors raised by a cache backend. Never leave the coordinator.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Named expiry durations, picked by the caller per indicator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlTier {
    Short,
    Medium,
    Long,
    Student,
}

impl TtlTier {
    pub fn seconds(&self) -> u64 {
        match self {
            TtlTier::Short => TTL_SHORT_SECS,
            TtlTier::Medium => TTL_MEDIUM_SECS,
            TtlTier::Long => TTL_LONG_SECS,
            TtlTier::Student => TTL_STUDENT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndicatorKind {
    CohortStatistics,
    TrackBreakdown,
    ModuleAnalysis,
    Absenteeism,
    CohortAlerts,
    StudentEvaluation,
    Interannual,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::CohortStatistics => "cohort_statistics",
            IndicatorKind::TrackBreakdown => "track_breakdown",
            IndicatorKind::ModuleAnalysis => "module_analysis",
            IndicatorKind::Absenteeism => "absenteeism",
            IndicatorKind::CohortAlerts => "cohort_alerts",
            IndicatorKind::StudentEvaluation => "student_evaluation",
            IndicatorKind::Interannual => "interannual",
        }
    }
}

/// Deterministic cache key:
/// `indicators:<department>:<kind>:<year>:<semester>[:<filter>=<value>...]`.
///
/// Every part goes through [`slug`], so filters that differ only by case,
/// accents or punctuation share a key. Empty filters are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    kind: IndicatorKind,
    department: String,
    year: String,
    semester: Option<u32>,
    filters: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(
        kind: IndicatorKind,
        department: &str,
        year: &str,
        semester: Option<u32>,
    ) -> Self {
        Self {
            kind,
            department: slug(department),
            year: slug(year),
            semester,
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, name: &str, value: Option<&str>) -> Self {
        if let Some(value) = value.map(slug).filter(|v| !v.is_empty()) {
            self.filters.insert(slug(name), value);
        }
        self
    }

    pub fn kind(&self) -> IndicatorKind {
        self.kind
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{KEY_NAMESPACE}:{}:{}:{}:",
            self.department,
            self.kind.as_str(),
            self.year
        )?;
        match self.semester {
            Some(index) => write!(f, "s{index}")?,
            None => write!(f, "all")?,
        }
        for (name, value) in &self.filters {
            write!(f, ":{name}={value}")?;
        }
        Ok(())
    }
}

/// Prefix covering every key of one department.
pub fn department_prefix(department: &str) -> String {
    format!("{KEY_NAMESPACE}:{}:", slug(department))
}

/// Key-value store the coordinator memoizes into.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend identifier used in logs
    fn name(&self) -> &'static str;

    /// Unexpired payload stored under `key`
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, CacheError>;

    /// Stores `payload`, replacing any previous entry and its expiry
    async fn set(
        &self,
        key: &str,
        payload: &str,
        ttl_seconds: u64,
    ) -> std::result::Result<(), CacheError>;

    /// Deletes every key starting with `prefix` (a trailing `*` is accepted),
    /// returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> std::result::Result<u64, CacheError>;
}

/// Backend that stores nothing. Stands in for an unreachable store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn get(&self, _key: &str) -> std::result::Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _payload: &str,
        _ttl_seconds: u64,
    ) -> std::result::Result<(), CacheError> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &str) -> std::result::Result<u64, CacheError> {
        Ok(0)
    }
}

/// Memoizing front of a [`CacheBackend`].
#[derive(Clone)]
pub struct IndicatorCache {
    backend: Arc<dyn CacheBackend>,
}

impl IndicatorCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Coordinator that always computes.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopCache))
    }

    /// Postgres-backed coordinator, or a disabled one when no URL is given or
    /// the database cannot be reached.
    pub async fn connect(database_url: Option<&str>) -> Self {
        let Some(url) = database_url else {
            info!("No cache database configured, indicators computed on every call");
            return Self::disabled();
        };
        match crate::db::connect(url).await {
            Ok(pool) => {
                info!("Indicator cache backed by Postgres");
                Self::new(Arc::new(crate::db::PgCache::new(pool)))
            }
            Err(e) => {
                warn!("Cache database unreachable, running without cache: {e}");
                Self::disabled()
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Returns the cached value under `key`, or runs `compute` and stores its
    /// result for `ttl`. `force_refresh` skips the read but still writes.
    ///
    /// Only errors of `compute` itself are returned.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        compute: F,
        ttl: TtlTier,
        force_refresh: bool,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = key.to_string();
        let backend = self.backend.name();

        if force_refresh {
            debug!(key = %key, "forced refresh, skipping cache read");
        } else {
            match self.backend.get(&key).await {
                Ok(Some(payload)) => match serde_json::from_str::<T>(&payload) {
                    Ok(value) => {
                        debug!(key = %key, backend, "cache hit");
                        return Ok(value);
                    }
                    Err(e) => warn!(key = %key, backend, "undecodable cache payload, recomputing: {e}"),
                },
                Ok(None) => debug!(key = %key, backend, "cache miss"),
                Err(e) => warn!(key = %key, backend, "cache read failed, computing directly: {e}"),
            }
        }

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(payload) => {
                if let Err(e) = self.backend.set(&key, &payload, ttl.seconds()).await {
                    warn!(key = %key, backend, "cache write failed: {e}");
                }
            }
            Err(e) => warn!(key = %key, "indicator could not be serialized for caching: {e}"),
        }
        Ok(value)
    }

    /// Deletes every entry under `prefix`. Backend failures count as 0.
    pub async fn invalidate(&self, prefix: &str) -> u64 {
        match self.backend.delete_prefix(prefix).await {
            Ok(removed) => {
                info!(prefix, removed, "cache entries invalidated");
                removed
            }
            Err(e) => {
                warn!(prefix, "cache invalidation failed: {e}");
                0
            }
        }
    }

    pub async fn invalidate_department(&self, department: &str) -> u64 {
        self.invalidate(&department_prefix(department)).await
    }
}
