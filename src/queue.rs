use crate::address::validate_address;
use crate::cache::EnrichmentCache;
use crate::cost;
use crate::errors::AppError;
use crate::job_store::JobStore;
use crate::models::{
    AddressInput, BatchEnrichmentRequest, BatchEnrichmentResult, CostEstimate, EnrichmentError,
    EnrichmentErrorType, EnrichmentJob, EnrichmentOptions, EnrichmentProvider, JobResults,
    JobStatus, PropertyRecord, ProviderOutcome,
};
use crate::providers::{BatchOptions, ProviderClient, ProviderFactory};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Rough wall-clock allowance per provider sub-batch, used only for the
/// `estimated_completion_at` hint.
const ESTIMATED_MILLIS_PER_CHUNK: i64 = 2_000;

/// Orchestrates batch property enrichment end to end.
///
/// Submission is synchronous up to job creation: validation, cache partition,
/// cost estimation and the ceiling check all happen before the caller gets a
/// response. Provider traffic runs on a detached background task; callers
/// follow progress by polling `get_job_status`.
#[derive(Clone)]
pub struct EnrichmentQueueManager {
    store: JobStore,
    cache: EnrichmentCache,
    providers: Arc<ProviderFactory>,
    default_cache_ttl_days: i64,
}

impl EnrichmentQueueManager {
    pub fn new(
        store: JobStore,
        cache: EnrichmentCache,
        providers: ProviderFactory,
        default_cache_ttl_days: i64,
    ) -> Self {
        Self {
            store,
            cache,
            providers: Arc::new(providers),
            default_cache_ttl_days,
        }
    }

    /// Computes the cost projection for a batch without creating a job,
    /// calling a provider, or mutating the cache.
    pub async fn estimate_cost(
        &self,
        addresses: &[AddressInput],
        provider: EnrichmentProvider,
        options: &EnrichmentOptions,
    ) -> Result<CostEstimate, AppError> {
        validate_batch(addresses)?;

        let cached = if options.use_cache && !options.force_refresh {
            self.cache.count_fresh(addresses).await?
        } else {
            0
        };

        Ok(cost::estimate(provider, addresses.len(), cached as usize))
    }

    /// Accepts a batch submission.
    ///
    /// Returns immediately with either a synthetic completed result (estimate
    /// dry run, or every address served from cache) or a `processing`
    /// envelope whose `job_id` the caller polls. Provider processing happens on a
    /// spawned task; a panic-free failure path marks the job `failed` rather
    /// than leaving it stuck.
    pub async fn start_enrichment_job(
        &self,
        tenant_id: &str,
        request: BatchEnrichmentRequest,
    ) -> Result<BatchEnrichmentResult, AppError> {
        validate_batch(&request.addresses)?;
        let options = request.options.clone();
        let provider = request.provider;
        let total = request.addresses.len() as i64;
        let now = Utc::now();

        if options.estimate_only {
            let estimate = self
                .estimate_cost(&request.addresses, provider, &options)
                .await?;
            enforce_cost_ceiling(&estimate, &options)?;

            tracing::info!(
                "Estimate-only batch for tenant {}: {} addresses, ${:.2}",
                tenant_id,
                total,
                estimate.total_cost
            );

            return Ok(BatchEnrichmentResult {
                job_id: None,
                status: JobStatus::Completed,
                total_addresses: total,
                processed_count: 0,
                successful_count: 0,
                failed_count: 0,
                cached_count: estimate.cached_results,
                results: Vec::new(),
                errors: Vec::new(),
                started_at: now,
                completed_at: Some(now),
                cost_estimate: Some(estimate),
                actual_cost: None,
            });
        }

        let lookup = if options.use_cache && !options.force_refresh {
            self.cache.lookup(&request.addresses).await?
        } else {
            crate::cache::CacheLookup {
                hits: Vec::new(),
                misses: request.addresses.clone(),
            }
        };

        let cached_count = lookup.hits.len() as i64;
        let estimate = cost::estimate(provider, request.addresses.len(), lookup.hits.len());
        enforce_cost_ceiling(&estimate, &options)?;

        if lookup.misses.is_empty() {
            tracing::info!(
                "Batch for tenant {} fully served from cache ({} addresses)",
                tenant_id,
                total
            );
            return Ok(BatchEnrichmentResult {
                job_id: None,
                status: JobStatus::Completed,
                total_addresses: total,
                processed_count: total,
                successful_count: cached_count,
                failed_count: 0,
                cached_count,
                results: lookup.hits,
                errors: Vec::new(),
                started_at: now,
                completed_at: Some(now),
                cost_estimate: Some(estimate),
                actual_cost: Some(0.0),
            });
        }

        // Resolve the client before the job row exists so an unconfigured
        // provider is a clean rejection, not a failed job.
        let client = self.providers.client_for(provider)?.clone();

        let chunks = lookup.misses.len().div_ceil(options.batch_size.max(1)) as i64;
        let estimated_completion_at =
            now + ChronoDuration::milliseconds(
                chunks * (ESTIMATED_MILLIS_PER_CHUNK + options.delay_ms as i64),
            );

        let job = EnrichmentJob {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            targeting_area_id: request.targeting_area_id.clone(),
            provider,
            status: JobStatus::Pending,
            total_items: total,
            processed_items: cached_count,
            successful_items: cached_count,
            failed_items: 0,
            cached_count,
            cost_estimate: Some(estimate.clone()),
            actual_cost: None,
            results: None,
            error_message: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
            estimated_completion_at: Some(estimated_completion_at),
        };
        self.store.insert(&job).await?;

        tracing::info!(
            "Created enrichment job {} for tenant {}: {} addresses ({} cached, {} to enrich via {})",
            job.id,
            tenant_id,
            total,
            cached_count,
            lookup.misses.len(),
            provider
        );

        let worker = self.clone();
        let job_id = job.id;
        let hits = lookup.hits.clone();
        let misses = lookup.misses;
        let worker_options = options.clone();
        tokio::spawn(async move {
            if let Err(e) = worker
                .process_job(job_id, provider, client, hits, misses, worker_options)
                .await
            {
                tracing::error!("Enrichment job {} failed: {}", job_id, e);
                if let Err(mark) = worker.store.fail(job_id, &e.to_string()).await {
                    tracing::error!("Could not mark job {} failed: {}", job_id, mark);
                }
            }
        });

        // The caller's envelope reports `processing` right away; the row
        // itself stays `pending` until the worker picks it up.
        Ok(BatchEnrichmentResult {
            job_id: Some(job.id),
            status: JobStatus::Processing,
            total_addresses: total,
            processed_count: cached_count,
            successful_count: cached_count,
            failed_count: 0,
            cached_count,
            results: lookup.hits,
            errors: Vec::new(),
            started_at: now,
            completed_at: None,
            cost_estimate: Some(estimate),
            actual_cost: None,
        })
    }

    /// Projects the current state of a job for its owning tenant.
    ///
    /// `None` when the id does not exist or belongs to another tenant; the two
    /// cases are indistinguishable to the caller.
    pub async fn get_job_status(
        &self,
        tenant_id: &str,
        job_id: Uuid,
    ) -> Result<Option<BatchEnrichmentResult>, AppError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(None);
        };
        if job.tenant_id != tenant_id {
            return Ok(None);
        }

        let (results, errors) = match job.results {
            Some(r) => (r.results, r.errors),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Some(BatchEnrichmentResult {
            job_id: Some(job.id),
            status: job.status,
            total_addresses: job.total_items,
            processed_count: job.processed_items,
            successful_count: job.successful_items,
            failed_count: job.failed_items,
            cached_count: job.cached_count,
            results,
            errors,
            started_at: job.started_at,
            completed_at: job.completed_at,
            cost_estimate: job.cost_estimate,
            actual_cost: job.actual_cost,
        }))
    }

    /// Fails `processing` jobs whose heartbeat went stale. Intended to run on
    /// a periodic timer.
    pub async fn reap_abandoned(&self, max_age: ChronoDuration) -> Result<u64, AppError> {
        self.store.reap_abandoned(max_age).await
    }

    /// Background worker for one job: drains the cache misses through the
    /// provider chunk by chunk, checkpointing progress after every chunk.
    ///
    /// Interim job-row writes are infrastructure, not outcome: a failed
    /// `mark_processing` or checkpoint is logged and swallowed so paid
    /// provider results are never discarded over a bookkeeping error. Only
    /// the terminal `complete` write can fail the job.
    async fn process_job(
        &self,
        job_id: Uuid,
        provider: EnrichmentProvider,
        client: ProviderClient,
        cached_hits: Vec<PropertyRecord>,
        misses: Vec<AddressInput>,
        options: EnrichmentOptions,
    ) -> Result<(), AppError> {
        if let Err(e) = self.store.mark_processing(job_id).await {
            tracing::warn!("Could not mark job {} processing: {}", job_id, e);
        }

        let ttl_days = options
            .cache_ttl_days
            .unwrap_or(self.default_cache_ttl_days);
        let batch_opts = BatchOptions::from(&options);

        let mut processed = cached_hits.len() as i64;
        let mut successful = cached_hits.len() as i64;
        let mut failed: i64 = 0;
        // Provider matches we pay for, qualifying or not.
        let mut billed: i64 = 0;

        let mut results = cached_hits;
        let mut errors: Vec<EnrichmentError> = Vec::new();

        for (i, chunk) in misses.chunks(batch_opts.batch_size).enumerate() {
            if i > 0 && batch_opts.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(batch_opts.delay_ms)).await;
            }

            for outcome in client.enrich_batch(chunk, &batch_opts).await {
                processed += 1;
                match outcome {
                    ProviderOutcome::Enriched(record) => {
                        billed += 1;
                        if let Err(e) = self.cache.store(&record, ttl_days).await {
                            tracing::warn!(
                                "Failed to cache result for {}: {}",
                                record.address_hash,
                                e
                            );
                        }
                        match qualify(&record, &options) {
                            Ok(()) => {
                                successful += 1;
                                results.push(*record);
                            }
                            Err(rejection) => {
                                failed += 1;
                                errors.push(rejection);
                            }
                        }
                    }
                    ProviderOutcome::Failed(error) => {
                        failed += 1;
                        errors.push(error);
                    }
                }
            }

            if let Err(e) = self
                .store
                .checkpoint(job_id, processed, successful, failed)
                .await
            {
                tracing::warn!("Checkpoint for job {} failed: {}", job_id, e);
            }
        }

        let actual_cost = billed as f64 * provider.cost_per_lookup();
        let payload = JobResults {
            average_quality_score: mean(results.iter().map(|r| f64::from(r.quality_score))),
            average_completeness: mean(results.iter().map(|r| f64::from(r.data_completeness))),
            results,
            errors,
        };

        tracing::info!(
            "Enrichment job {} completed: {} successful, {} failed, ${:.2} spent",
            job_id,
            successful,
            failed,
            actual_cost
        );

        self.store
            .complete(job_id, &payload, actual_cost, processed, successful, failed)
            .await
    }
}

/// Applies the caller's quality gates to a genuine provider match. The record
/// is already cached by the time this runs; rejection affects only this job's
/// accounting.
fn qualify(record: &PropertyRecord, options: &EnrichmentOptions) -> Result<(), EnrichmentError> {
    if let Some(min) = options.min_quality_score {
        if record.quality_score < min {
            return Err(EnrichmentError {
                address: record.address.clone(),
                error_type: EnrichmentErrorType::InvalidAddress,
                error_message: format!(
                    "quality score {} below required minimum {}",
                    record.quality_score, min
                ),
                details: Some(json!({
                    "quality_score": record.quality_score,
                    "min_quality_score": min,
                })),
                retry_count: 0,
                timestamp: Utc::now(),
            });
        }
    }

    if options.require_owner_phone && record.owner_phone.is_none() {
        return Err(quality_rejection(record, "owner phone"));
    }
    if options.require_owner_email && record.owner_email.is_none() {
        return Err(quality_rejection(record, "owner email"));
    }

    Ok(())
}

fn quality_rejection(record: &PropertyRecord, field: &str) -> EnrichmentError {
    EnrichmentError {
        address: record.address.clone(),
        error_type: EnrichmentErrorType::QualityRejected,
        error_message: format!("matched property is missing required {}", field),
        details: None,
        retry_count: 0,
        timestamp: Utc::now(),
    }
}

fn validate_batch(addresses: &[AddressInput]) -> Result<(), AppError> {
    if addresses.is_empty() {
        return Err(AppError::BadRequest(
            "at least one address is required".to_string(),
        ));
    }

    for (i, address) in addresses.iter().enumerate() {
        if let Err(reason) = validate_address(address) {
            return Err(AppError::BadRequest(format!(
                "address at index {} is invalid: {}",
                i, reason
            )));
        }
    }

    Ok(())
}

fn enforce_cost_ceiling(
    estimate: &CostEstimate,
    options: &EnrichmentOptions,
) -> Result<(), AppError> {
    if let Some(limit) = options.max_cost_dollars {
        if estimate.total_cost > limit {
            return Err(AppError::CostLimitExceeded {
                estimated: estimate.total_cost,
                limit,
            });
        }
    }
    Ok(())
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
