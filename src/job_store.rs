use crate::errors::{AppError, ResultExt};
use crate::models::{CostEstimate, EnrichmentJob, JobResults, JobStatus};
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Durable store for enrichment job records.
///
/// One row per batch submission. Counters are checkpointed after every chunk;
/// `updated_at` doubles as the liveness heartbeat. Terminal rows are never
/// transitioned back: every status-changing statement guards on the current
/// status.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a freshly created job row.
    pub async fn insert(&self, job: &EnrichmentJob) -> Result<(), AppError> {
        let cost_estimate = job
            .cost_estimate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::InternalError(format!("Failed to serialize estimate: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO enrichment_jobs
                (id, tenant_id, targeting_area_id, provider, status,
                 total_items, processed_items, successful_items, failed_items, cached_count,
                 cost_estimate, started_at, updated_at, estimated_completion_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.tenant_id)
        .bind(&job.targeting_area_id)
        .bind(job.provider.as_str())
        .bind(job.status.as_str())
        .bind(job.total_items)
        .bind(job.processed_items)
        .bind(job.successful_items)
        .bind(job.failed_items)
        .bind(job.cached_count)
        .bind(cost_estimate)
        .bind(job.started_at)
        .bind(job.updated_at)
        .bind(job.estimated_completion_at)
        .execute(&self.pool)
        .await
        .context("inserting enrichment job")?;

        Ok(())
    }

    /// Reads a job by id. `None` when the id does not exist.
    pub async fn get(&self, id: Uuid) -> Result<Option<EnrichmentJob>, AppError> {
        let row = sqlx::query("SELECT * FROM enrichment_jobs WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode_job).transpose()
    }

    /// Moves a pending job into `processing`.
    pub async fn mark_processing(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE enrichment_jobs SET status = 'processing', updated_at = $2
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Durable per-chunk checkpoint: absolute progress counters plus the
    /// heartbeat. The only persistence point during processing; a crash loses
    /// at most the current chunk.
    pub async fn checkpoint(
        &self,
        id: Uuid,
        processed_items: i64,
        successful_items: i64,
        failed_items: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET processed_items = $2,
                successful_items = $3,
                failed_items = $4,
                updated_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.to_string())
        .bind(processed_items)
        .bind(successful_items)
        .bind(failed_items)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes the terminal results payload and completes the job.
    ///
    /// The final counters are written here too, not just at checkpoints, so a
    /// job whose interim checkpoints were lost to infrastructure errors still
    /// reads consistently once terminal.
    pub async fn complete(
        &self,
        id: Uuid,
        results: &JobResults,
        actual_cost: f64,
        processed_items: i64,
        successful_items: i64,
        failed_items: i64,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_string(results)
            .map_err(|e| AppError::InternalError(format!("Failed to serialize results: {}", e)))?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET status = 'completed',
                results = $2,
                actual_cost = $3,
                processed_items = $4,
                successful_items = $5,
                failed_items = $6,
                completed_at = $7,
                updated_at = $7
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id.to_string())
        .bind(payload)
        .bind(actual_cost)
        .bind(processed_items)
        .bind(successful_items)
        .bind(failed_items)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a job failed with the escaping error message. No-op on rows that
    /// already went terminal.
    pub async fn fail(&self, id: Uuid, message: &str) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET status = 'failed',
                error_message = $2,
                completed_at = $3,
                updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id.to_string())
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fails `processing` jobs whose heartbeat is older than `max_age`.
    ///
    /// Covers the crashed-worker gap: a job whose owner died would otherwise
    /// stay `processing` forever. Returns the number of jobs reaped.
    pub async fn reap_abandoned(&self, max_age: Duration) -> Result<u64, AppError> {
        let now = Utc::now();
        let cutoff = now - max_age;

        let result = sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET status = 'failed',
                error_message = 'abandoned: no progress heartbeat within the allowed window',
                completed_at = $1,
                updated_at = $1
            WHERE status = 'processing' AND updated_at < $2
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            tracing::warn!("Reaped {} abandoned enrichment job(s)", reaped);
        }
        Ok(reaped)
    }
}

fn decode_job(row: sqlx::sqlite::SqliteRow) -> Result<EnrichmentJob, AppError> {
    let id: String = row.try_get("id")?;
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let cost_estimate: Option<String> = row.try_get("cost_estimate")?;
    let results: Option<String> = row.try_get("results")?;

    let cost_estimate: Option<CostEstimate> = cost_estimate
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| AppError::InternalError(format!("Corrupt cost_estimate column: {}", e)))?;
    let results: Option<JobResults> = results
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| AppError::InternalError(format!("Corrupt results column: {}", e)))?;

    Ok(EnrichmentJob {
        id: Uuid::parse_str(&id)
            .map_err(|e| AppError::InternalError(format!("Corrupt job id '{}': {}", id, e)))?,
        tenant_id: row.try_get("tenant_id")?,
        targeting_area_id: row.try_get("targeting_area_id")?,
        provider: provider
            .parse()
            .map_err(|e: String| AppError::InternalError(e))?,
        status: status
            .parse::<JobStatus>()
            .map_err(AppError::InternalError)?,
        total_items: row.try_get("total_items")?,
        processed_items: row.try_get("processed_items")?,
        successful_items: row.try_get("successful_items")?,
        failed_items: row.try_get("failed_items")?,
        cached_count: row.try_get("cached_count")?,
        cost_estimate,
        actual_cost: row.try_get("actual_cost")?,
        results,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        estimated_completion_at: row.try_get("estimated_completion_at")?,
    })
}
