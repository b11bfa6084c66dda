/// End-to-end tests for the enrichment queue orchestrator
/// In-memory SQLite plus mocked provider HTTP APIs
use property_enrichment_api::cache::EnrichmentCache;
use property_enrichment_api::config::Config;
use property_enrichment_api::db::init_schema;
use property_enrichment_api::errors::AppError;
use property_enrichment_api::job_store::JobStore;
use property_enrichment_api::models::{
    AddressInput, BatchEnrichmentRequest, BatchEnrichmentResult, EnrichmentErrorType,
    EnrichmentOptions, EnrichmentProvider, JobStatus,
};
use property_enrichment_api::providers::{record_from_payload, ProviderFactory};
use property_enrichment_api::queue::EnrichmentQueueManager;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TENANT: &str = "tenant-a";

fn test_config(batchdata_base_url: String) -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        port: 3000,
        batchdata_base_url,
        batchdata_api_key: Some("test-key".to_string()),
        tracerfy_base_url: "https://api.tracerfy.invalid".to_string(),
        tracerfy_api_key: None,
        cache_ttl_days: 30,
    }
}

async fn setup(server: &MockServer) -> (EnrichmentQueueManager, EnrichmentCache, SqlitePool) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();

    let config = test_config(server.uri());
    let cache = EnrichmentCache::new(pool.clone());
    let store = JobStore::new(pool.clone());
    let providers = ProviderFactory::from_config(&config).unwrap();
    let manager = EnrichmentQueueManager::new(store, cache.clone(), providers, 30);

    (manager, cache, pool)
}

fn address(street: &str) -> AddressInput {
    AddressInput {
        street: street.to_string(),
        city: "Nashville".to_string(),
        state: "TN".to_string(),
        zip: "37203".to_string(),
        unit: None,
    }
}

fn fast_options() -> EnrichmentOptions {
    EnrichmentOptions {
        delay_ms: 0,
        ..Default::default()
    }
}

fn request(addresses: Vec<AddressInput>, options: EnrichmentOptions) -> BatchEnrichmentRequest {
    BatchEnrichmentRequest {
        addresses,
        provider: EnrichmentProvider::BatchData,
        targeting_area_id: None,
        options,
    }
}

/// Rich payload scoring well above any reasonable quality floor.
fn rich_payload() -> serde_json::Value {
    json!({
        "owner": {"name": "Jane Doe", "phone": "+16155550100", "email": "jane@example.com"},
        "building": {"year_built": 1987, "square_feet": 2100},
        "valuation": {"assessed_value": 310000, "market_value": 385000},
    })
}

/// Sparse payload: owner name only, scores 10.
fn sparse_payload() -> serde_json::Value {
    json!({"owner": {"name": "J. Doe"}})
}

async fn job_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_jobs")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn wait_for_terminal(
    manager: &EnrichmentQueueManager,
    job_id: Uuid,
) -> BatchEnrichmentResult {
    for _ in 0..200 {
        let status = manager
            .get_job_status(TENANT, job_id)
            .await
            .unwrap()
            .expect("job should exist");
        if status.status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} did not reach a terminal state in time", job_id);
}

#[tokio::test]
async fn estimate_only_touches_nothing() {
    let server = MockServer::start().await;
    // Any provider call fails the test.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let (manager, _cache, pool) = setup(&server).await;

    let options = EnrichmentOptions {
        estimate_only: true,
        ..fast_options()
    };
    let result = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St"), address("2 Oak St")], options))
        .await
        .unwrap();

    assert_eq!(result.job_id, None);
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.total_addresses, 2);
    assert_eq!(result.processed_count, 0);

    let estimate = result.cost_estimate.unwrap();
    assert_eq!(estimate.new_lookups, 2);
    assert!((estimate.total_cost - 0.20).abs() < 1e-9);

    assert_eq!(job_count(&pool).await, 0);
}

#[tokio::test]
async fn cost_ceiling_rejects_before_any_side_effect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let (manager, _cache, pool) = setup(&server).await;

    let options = EnrichmentOptions {
        max_cost_dollars: Some(0.05),
        ..fast_options()
    };
    let err = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St")], options))
        .await
        .unwrap_err();

    match err {
        AppError::CostLimitExceeded { estimated, limit } => {
            assert!((estimated - 0.10).abs() < 1e-9);
            assert!((limit - 0.05).abs() < 1e-9);
        }
        other => panic!("expected CostLimitExceeded, got {:?}", other),
    }
    assert_eq!(job_count(&pool).await, 0);
}

#[tokio::test]
async fn empty_batch_is_a_bad_request() {
    let server = MockServer::start().await;
    let (manager, _cache, _pool) = setup(&server).await;

    let err = manager
        .start_enrichment_job(TENANT, request(vec![], fast_options()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn unconfigured_provider_is_rejected_cleanly() {
    let server = MockServer::start().await;
    let (manager, _cache, pool) = setup(&server).await;

    let mut req = request(vec![address("1 Oak St")], fast_options());
    req.provider = EnrichmentProvider::Tracerfy;

    let err = manager.start_enrichment_job(TENANT, req).await.unwrap_err();
    assert!(matches!(err, AppError::ProviderNotConfigured(_)));
    assert_eq!(job_count(&pool).await, 0);
}

#[tokio::test]
async fn fully_cached_batch_completes_without_a_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let (manager, cache, pool) = setup(&server).await;

    for street in ["1 Oak St", "2 Oak St"] {
        let record =
            record_from_payload(EnrichmentProvider::BatchData, &address(street), &rich_payload());
        cache.store(&record, 30).await.unwrap();
    }

    let result = manager
        .start_enrichment_job(
            TENANT,
            request(vec![address("1 Oak St"), address("2 Oak St")], fast_options()),
        )
        .await
        .unwrap();

    assert_eq!(result.job_id, None);
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.cached_count, 2);
    assert_eq!(result.successful_count, 2);
    assert_eq!(result.actual_cost, Some(0.0));
    assert_eq!(result.results.len(), 2);
    assert!(result.results.iter().all(|r| r.cached));
    assert_eq!(job_count(&pool).await, 0);
}

#[tokio::test]
async fn partial_failure_does_not_abort_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"status": "success", "data": rich_payload()},
                {"status": "no_match"},
                {"status": "success", "data": rich_payload()},
            ],
        })))
        .mount(&server)
        .await;

    let (manager, _cache, _pool) = setup(&server).await;

    let result = manager
        .start_enrichment_job(
            TENANT,
            request(
                vec![address("1 Oak St"), address("2 Oak St"), address("3 Oak St")],
                fast_options(),
            ),
        )
        .await
        .unwrap();
    assert_eq!(result.status, JobStatus::Processing);
    let job_id = result.job_id.expect("a background job should exist");

    let terminal = wait_for_terminal(&manager, job_id).await;
    assert_eq!(terminal.status, JobStatus::Completed);
    assert_eq!(terminal.total_addresses, 3);
    assert_eq!(terminal.processed_count, 3);
    assert_eq!(terminal.successful_count, 2);
    assert_eq!(terminal.failed_count, 1);
    assert_eq!(terminal.errors.len(), 1);
    assert_eq!(
        terminal.errors[0].error_type,
        EnrichmentErrorType::InvalidAddress
    );
    assert_eq!(terminal.errors[0].address.street, "2 Oak St");
}

#[tokio::test]
async fn checkpoint_failures_do_not_fail_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"status": "success", "data": rich_payload()},
                {"status": "success", "data": rich_payload()},
            ],
        })))
        .mount(&server)
        .await;

    let (manager, _cache, pool) = setup(&server).await;

    // Reject every interim progress write while the row is still in flight.
    // Terminal completion writes go through because they flip the status.
    sqlx::query(
        r#"
        CREATE TRIGGER reject_progress_writes
        BEFORE UPDATE OF processed_items ON enrichment_jobs
        WHEN NEW.status = 'processing'
        BEGIN
            SELECT RAISE(ABORT, 'disk I/O error');
        END
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let result = manager
        .start_enrichment_job(
            TENANT,
            request(vec![address("1 Oak St"), address("2 Oak St")], fast_options()),
        )
        .await
        .unwrap();
    let job_id = result.job_id.unwrap();

    // Every enrichment succeeded; lost checkpoints must not turn that into a
    // failed job.
    let terminal = wait_for_terminal(&manager, job_id).await;
    assert_eq!(terminal.status, JobStatus::Completed);
    assert_eq!(terminal.processed_count, 2);
    assert_eq!(terminal.successful_count, 2);
    assert_eq!(terminal.failed_count, 0);
    assert_eq!(terminal.results.len(), 2);
    assert!((terminal.actual_cost.unwrap() - 0.20).abs() < 1e-9);
}

#[tokio::test]
async fn mixed_cache_and_quality_filtering_end_to_end() {
    let server = MockServer::start().await;
    // Two misses reach the provider: one rich match, one sparse match that
    // will fall below the quality floor.
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"status": "success", "data": rich_payload()},
                {"status": "success", "data": sparse_payload()},
            ],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, cache, _pool) = setup(&server).await;

    let cached =
        record_from_payload(EnrichmentProvider::BatchData, &address("1 Oak St"), &rich_payload());
    cache.store(&cached, 30).await.unwrap();

    let options = EnrichmentOptions {
        min_quality_score: Some(50),
        ..fast_options()
    };
    let result = manager
        .start_enrichment_job(
            TENANT,
            request(
                vec![address("1 Oak St"), address("2 Oak St"), address("3 Oak St")],
                options,
            ),
        )
        .await
        .unwrap();

    assert_eq!(result.cached_count, 1);
    let job_id = result.job_id.expect("a background job should exist");

    let terminal = wait_for_terminal(&manager, job_id).await;
    assert_eq!(terminal.status, JobStatus::Completed);
    assert_eq!(terminal.total_addresses, 3);
    assert_eq!(terminal.processed_count, 3);
    assert_eq!(terminal.successful_count, 2);
    assert_eq!(terminal.failed_count, 1);
    assert_eq!(terminal.cached_count, 1);

    // The low-score match is reported as invalid_address with both scores.
    let error = &terminal.errors[0];
    assert_eq!(error.error_type, EnrichmentErrorType::InvalidAddress);
    assert_eq!(error.address.street, "3 Oak St");
    let details = error.details.as_ref().unwrap();
    assert_eq!(details["min_quality_score"], 50);

    // Both provider matches were paid for, qualifying or not.
    assert!((terminal.actual_cost.unwrap() - 0.20).abs() < 1e-9);

    // The cache keeps every genuine match, including the rejected one.
    assert_eq!(cache.stats().await.unwrap().total_rows, 3);
}

#[tokio::test]
async fn quality_rejection_is_distinct_from_invalid_address() {
    let server = MockServer::start().await;
    // Genuine match with no phone on file.
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"status": "success", "data": {
                    "owner": {"name": "Jane Doe", "email": "jane@example.com"},
                    "valuation": {"market_value": 385000},
                }},
            ],
        })))
        .mount(&server)
        .await;

    let (manager, cache, _pool) = setup(&server).await;

    let options = EnrichmentOptions {
        require_owner_phone: true,
        ..fast_options()
    };
    let result = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St")], options))
        .await
        .unwrap();
    let job_id = result.job_id.unwrap();

    let terminal = wait_for_terminal(&manager, job_id).await;
    assert_eq!(terminal.successful_count, 0);
    assert_eq!(terminal.failed_count, 1);
    assert_eq!(
        terminal.errors[0].error_type,
        EnrichmentErrorType::QualityRejected
    );
    // Still cached: the rejection is this caller's, not the data's.
    assert_eq!(cache.stats().await.unwrap().total_rows, 1);
}

#[tokio::test]
async fn force_refresh_bypasses_cache_hits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"status": "success", "data": rich_payload()}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, cache, _pool) = setup(&server).await;
    let cached =
        record_from_payload(EnrichmentProvider::BatchData, &address("1 Oak St"), &rich_payload());
    cache.store(&cached, 30).await.unwrap();

    let options = EnrichmentOptions {
        force_refresh: true,
        ..fast_options()
    };
    let result = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St")], options))
        .await
        .unwrap();

    assert_eq!(result.cached_count, 0);
    let job_id = result.job_id.expect("refresh must create a job");

    let terminal = wait_for_terminal(&manager, job_id).await;
    assert_eq!(terminal.successful_count, 1);
    assert!((terminal.actual_cost.unwrap() - 0.10).abs() < 1e-9);
}

#[tokio::test]
async fn job_status_is_tenant_scoped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"status": "success", "data": rich_payload()}],
        })))
        .mount(&server)
        .await;

    let (manager, _cache, _pool) = setup(&server).await;
    let result = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St")], fast_options()))
        .await
        .unwrap();
    let job_id = result.job_id.unwrap();

    assert!(manager
        .get_job_status("tenant-b", job_id)
        .await
        .unwrap()
        .is_none());
    assert!(manager
        .get_job_status(TENANT, job_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unknown_job_id_reads_as_none() {
    let server = MockServer::start().await;
    let (manager, _cache, _pool) = setup(&server).await;

    let status = manager.get_job_status(TENANT, Uuid::new_v4()).await.unwrap();
    assert!(status.is_none());
}

#[tokio::test]
async fn second_batch_reuses_the_first_batch_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/property/skip-trace"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"status": "success", "data": rich_payload()}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, _cache, _pool) = setup(&server).await;

    let first = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St")], fast_options()))
        .await
        .unwrap();
    wait_for_terminal(&manager, first.job_id.unwrap()).await;

    // Same address again: served entirely from cache, no second provider call.
    let second = manager
        .start_enrichment_job(TENANT, request(vec![address("1 Oak St")], fast_options()))
        .await
        .unwrap();
    assert_eq!(second.job_id, None);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.cached_count, 1);
}

#[tokio::test]
async fn stale_processing_jobs_are_reaped() {
    let server = MockServer::start().await;
    let (manager, _cache, pool) = setup(&server).await;

    // Simulate a worker that died mid-flight.
    let job_id = Uuid::new_v4();
    let stale = chrono::Utc::now() - chrono::Duration::minutes(30);
    sqlx::query(
        r#"
        INSERT INTO enrichment_jobs
            (id, tenant_id, provider, status, total_items, started_at, updated_at)
        VALUES ($1, $2, 'batchdata', 'processing', 5, $3, $3)
        "#,
    )
    .bind(job_id.to_string())
    .bind(TENANT)
    .bind(stale)
    .execute(&pool)
    .await
    .unwrap();

    let reaped = manager
        .reap_abandoned(chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let status = manager
        .get_job_status(TENANT, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, JobStatus::Failed);
}
