use crate::address::hash_address;
use crate::errors::AppError;
use crate::models::{AddressInput, PropertyRecord};
use crate::quality;
use chrono::{DateTime, Duration, Utc};
use moka::future::Cache as HotCache;
use sqlx::{QueryBuilder, Row, SqlitePool};

/// Persistent enrichment cache keyed by address hash.
///
/// Rows are only ever written for genuine provider successes; expired rows
/// are functionally misses. Quality and completeness are recomputed on every
/// read, never trusted from the stored blob. A small in-process hot tier
/// fronts the table; the `expires_at` check runs on both tiers so neither can
/// serve stale data.
#[derive(Clone)]
pub struct EnrichmentCache {
    pool: SqlitePool,
    hot: HotCache<String, PropertyRecord>,
}

/// Result of partitioning a batch against the cache.
#[derive(Debug, Default)]
pub struct CacheLookup {
    /// Non-expired cached records, annotated and flagged `cached`.
    pub hits: Vec<PropertyRecord>,
    /// Addresses with no usable cache row, in submission order.
    pub misses: Vec<AddressInput>,
}

/// Operational counters surfaced on the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub total_rows: i64,
    pub expired_rows: i64,
    pub total_hits: i64,
}

impl EnrichmentCache {
    pub fn new(pool: SqlitePool) -> Self {
        // Hot tier TTL stays well under any row TTL; the expires_at field is
        // still the source of truth on every read.
        let hot = HotCache::builder()
            .time_to_live(std::time::Duration::from_secs(3600))
            .max_capacity(50_000)
            .build();

        Self { pool, hot }
    }

    /// Partitions `addresses` into cache hits and misses.
    ///
    /// Hits get quality/completeness recomputed and their hit counters bumped
    /// best-effort: a failed bump is logged and swallowed, never a lookup
    /// failure.
    pub async fn lookup(&self, addresses: &[AddressInput]) -> Result<CacheLookup, AppError> {
        if addresses.is_empty() {
            return Ok(CacheLookup::default());
        }

        let now = Utc::now();
        let mut lookup = CacheLookup::default();
        let mut cold = Vec::new();
        let mut hit_hashes = Vec::new();

        for address in addresses {
            let hash = hash_address(address);
            match self.hot.get(&hash).await {
                Some(mut record) if record.expires_at.is_some_and(|exp| exp > now) => {
                    // Returned records count the current hit; the hot tier is
                    // refreshed so repeated hits stay in step with the row.
                    record.hit_count += 1;
                    self.hot.insert(hash.clone(), record.clone()).await;
                    lookup.hits.push(self.as_hit(record));
                    hit_hashes.push(hash);
                }
                Some(_) => {
                    // Expired entry lingering in the hot tier.
                    self.hot.invalidate(&hash).await;
                    cold.push((hash, address.clone()));
                }
                None => cold.push((hash, address.clone())),
            }
        }

        if !cold.is_empty() {
            let mut qb = QueryBuilder::new(
                "SELECT address_hash, record, expires_at, hit_count FROM enrichment_cache WHERE expires_at > ",
            );
            qb.push_bind(now);
            qb.push(" AND address_hash IN (");
            {
                let mut separated = qb.separated(", ");
                for (hash, _) in &cold {
                    separated.push_bind(hash.clone());
                }
            }
            qb.push(")");

            let rows = qb.build().fetch_all(&self.pool).await?;

            let mut found: std::collections::HashMap<String, PropertyRecord> =
                std::collections::HashMap::with_capacity(rows.len());
            for row in rows {
                let hash: String = row.try_get("address_hash")?;
                let blob: String = row.try_get("record")?;
                let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
                let hit_count: i64 = row.try_get("hit_count")?;

                let mut record: PropertyRecord = match serde_json::from_str(&blob) {
                    Ok(record) => record,
                    Err(e) => {
                        // A corrupt row is a miss; the next store overwrites it.
                        tracing::warn!("Discarding undecodable cache row {}: {}", hash, e);
                        continue;
                    }
                };
                record.expires_at = Some(expires_at);
                record.hit_count = hit_count;
                found.insert(hash, record);
            }

            for (hash, address) in cold {
                match found.remove(&hash) {
                    Some(mut record) if record.expires_at.is_some_and(|exp| exp > now) => {
                        record.hit_count += 1;
                        self.hot.insert(hash.clone(), record.clone()).await;
                        lookup.hits.push(self.as_hit(record));
                        hit_hashes.push(hash);
                    }
                    _ => lookup.misses.push(address),
                }
            }
        }

        if !hit_hashes.is_empty() {
            if let Err(e) = self.bump_hit_counts(&hit_hashes, now).await {
                tracing::warn!("Failed to bump cache hit counters: {}", e);
            }
        }

        tracing::debug!(
            "Cache lookup: {} hits, {} misses of {}",
            lookup.hits.len(),
            lookup.misses.len(),
            addresses.len()
        );

        Ok(lookup)
    }

    /// Upserts a successful enrichment result, keyed by address hash.
    ///
    /// Idempotent: re-storing the same hash overwrites the row and resets its
    /// hit counter. The caller guarantees success; failures never reach here
    /// because `ProviderOutcome::Failed` carries no record to store.
    pub async fn store(&self, record: &PropertyRecord, ttl_days: i64) -> Result<(), AppError> {
        let now = Utc::now();
        let expires_at = now + Duration::days(ttl_days.max(1));

        let mut stored = record.clone();
        stored.cached = false;
        stored.expires_at = Some(expires_at);
        stored.hit_count = 0;

        let blob = serde_json::to_string(&stored)
            .map_err(|e| AppError::InternalError(format!("Failed to serialize record: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO enrichment_cache
                (address_hash, provider, record, enriched_at, expires_at, hit_count, last_accessed_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            ON CONFLICT (address_hash) DO UPDATE SET
                provider = excluded.provider,
                record = excluded.record,
                enriched_at = excluded.enriched_at,
                expires_at = excluded.expires_at,
                hit_count = 0,
                last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(&stored.address_hash)
        .bind(stored.provider.as_str())
        .bind(&blob)
        .bind(stored.enriched_at)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.hot.insert(stored.address_hash.clone(), stored).await;

        Ok(())
    }

    /// Counts how many of `addresses` have a fresh cache row, without bumping
    /// hit counters. Used by cost estimation, which must not mutate anything.
    pub async fn count_fresh(&self, addresses: &[AddressInput]) -> Result<i64, AppError> {
        if addresses.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(
            "SELECT COUNT(*) AS fresh FROM enrichment_cache WHERE expires_at > ",
        );
        qb.push_bind(Utc::now());
        qb.push(" AND address_hash IN (");
        {
            let mut separated = qb.separated(", ");
            for address in addresses {
                separated.push_bind(hash_address(address));
            }
        }
        qb.push(")");

        let row = qb.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("fresh")?)
    }

    /// Row/hit counters for operability.
    pub async fn stats(&self) -> Result<CacheStats, AppError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_rows,
                COALESCE(SUM(CASE WHEN expires_at <= $1 THEN 1 ELSE 0 END), 0) AS expired_rows,
                COALESCE(SUM(hit_count), 0) AS total_hits
            FROM enrichment_cache
            "#,
        )
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            total_rows: row.try_get("total_rows")?,
            expired_rows: row.try_get("expired_rows")?,
            total_hits: row.try_get("total_hits")?,
        })
    }

    fn as_hit(&self, mut record: PropertyRecord) -> PropertyRecord {
        record.cached = true;
        quality::annotate(&mut record);
        record
    }

    async fn bump_hit_counts(
        &self,
        hashes: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut qb = QueryBuilder::new(
            "UPDATE enrichment_cache SET hit_count = hit_count + 1, last_accessed_at = ",
        );
        qb.push_bind(now);
        qb.push(" WHERE address_hash IN (");
        {
            let mut separated = qb.separated(", ");
            for hash in hashes {
                separated.push_bind(hash.clone());
            }
        }
        qb.push(")");

        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}
