use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Schema for the two persistent stores of the enrichment pipeline. Applied
/// idempotently at pool creation.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS enrichment_cache (
    address_hash     TEXT PRIMARY KEY,
    provider         TEXT NOT NULL,
    record           TEXT NOT NULL,
    enriched_at      TEXT NOT NULL,
    expires_at       TEXT NOT NULL,
    hit_count        INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrichment_cache_expires_at
    ON enrichment_cache (expires_at);

CREATE TABLE IF NOT EXISTS enrichment_jobs (
    id                      TEXT PRIMARY KEY,
    tenant_id               TEXT NOT NULL,
    targeting_area_id       TEXT,
    provider                TEXT NOT NULL,
    status                  TEXT NOT NULL,
    total_items             INTEGER NOT NULL,
    processed_items         INTEGER NOT NULL DEFAULT 0,
    successful_items        INTEGER NOT NULL DEFAULT 0,
    failed_items            INTEGER NOT NULL DEFAULT 0,
    cached_count            INTEGER NOT NULL DEFAULT 0,
    cost_estimate           TEXT,
    actual_cost             REAL,
    results                 TEXT,
    error_message           TEXT,
    started_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    completed_at            TEXT,
    estimated_completion_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_enrichment_jobs_tenant
    ON enrichment_jobs (tenant_id, started_at);
"#;

/// Thin wrapper owning the connection pool.
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        init_schema(&pool).await?;

        Ok(Self { pool })
    }
}

/// Applies the schema. Safe to call repeatedly.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
