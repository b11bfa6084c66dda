/// Integration tests for the persistent enrichment cache
/// Runs against an in-memory SQLite database
use chrono::{Duration, Utc};
use property_enrichment_api::cache::EnrichmentCache;
use property_enrichment_api::db::init_schema;
use property_enrichment_api::models::{AddressInput, EnrichmentProvider, PropertyRecord};
use property_enrichment_api::providers::record_from_payload;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
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

fn record(street: &str) -> PropertyRecord {
    let payload = json!({
        "owner": {"name": "Jane Doe", "phone": "+16155550100", "email": "jane@example.com"},
        "building": {"year_built": 1987, "square_feet": 2100},
        "valuation": {"market_value": 385000},
    });
    record_from_payload(EnrichmentProvider::BatchData, &address(street), &payload)
}

#[tokio::test]
async fn store_then_lookup_is_a_hit() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    let lookup = cache.lookup(&[address("123 Oak St")]).await.unwrap();
    assert_eq!(lookup.hits.len(), 1);
    assert!(lookup.misses.is_empty());

    let hit = &lookup.hits[0];
    assert!(hit.cached);
    assert!(hit.expires_at.is_some());
    assert_eq!(hit.owner_name.as_deref(), Some("Jane Doe"));
    // Derived metrics are recomputed on read.
    assert!(hit.quality_score > 0);
}

#[tokio::test]
async fn unknown_address_is_a_miss() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    let lookup = cache
        .lookup(&[address("123 Oak St"), address("456 Elm Ave")])
        .await
        .unwrap();
    assert_eq!(lookup.hits.len(), 1);
    assert_eq!(lookup.misses.len(), 1);
    assert_eq!(lookup.misses[0].street, "456 Elm Ave");
}

#[tokio::test]
async fn lookup_normalizes_before_hashing() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    let lookup = cache.lookup(&[address("  123  OAK  st ")]).await.unwrap();
    assert_eq!(lookup.hits.len(), 1);
}

#[tokio::test]
async fn double_store_keeps_one_row() {
    let pool = test_pool().await;
    let cache = EnrichmentCache::new(pool.clone());

    cache.store(&record("123 Oak St"), 30).await.unwrap();
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_rows, 1);
}

#[tokio::test]
async fn restore_overwrites_and_resets_hit_count() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    // Serve a hit so the counter is non-zero.
    cache.lookup(&[address("123 Oak St")]).await.unwrap();
    assert_eq!(cache.stats().await.unwrap().total_hits, 1);

    let mut updated = record("123 Oak St");
    updated.owner_name = Some("John Roe".to_string());
    cache.store(&updated, 30).await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_rows, 1);
    assert_eq!(stats.total_hits, 0);

    let lookup = cache.lookup(&[address("123 Oak St")]).await.unwrap();
    assert_eq!(lookup.hits[0].owner_name.as_deref(), Some("John Roe"));
}

#[tokio::test]
async fn expired_row_is_a_miss() {
    let pool = test_pool().await;
    {
        let cache = EnrichmentCache::new(pool.clone());
        cache.store(&record("123 Oak St"), 30).await.unwrap();
    }

    // Age the row past its expiry behind the cache's back.
    let past = Utc::now() - Duration::days(1);
    sqlx::query("UPDATE enrichment_cache SET expires_at = $1")
        .bind(past)
        .execute(&pool)
        .await
        .unwrap();

    // Fresh instance so the hot tier cannot mask the expired row.
    let cache = EnrichmentCache::new(pool);
    let lookup = cache.lookup(&[address("123 Oak St")]).await.unwrap();
    assert!(lookup.hits.is_empty());
    assert_eq!(lookup.misses.len(), 1);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_rows, 1);
    assert_eq!(stats.expired_rows, 1);
}

#[tokio::test]
async fn hits_increment_the_counter() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    cache.lookup(&[address("123 Oak St")]).await.unwrap();
    cache.lookup(&[address("123 Oak St")]).await.unwrap();
    // A miss does not bump anything.
    cache.lookup(&[address("456 Elm Ave")]).await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_hits, 2);
}

#[tokio::test]
async fn returned_hit_count_tracks_repeated_hits() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    // Every hit is served from the hot tier here; the counter in the
    // returned record must keep moving with the row's counter anyway.
    for expected in 1..=3i64 {
        let lookup = cache.lookup(&[address("123 Oak St")]).await.unwrap();
        assert_eq!(lookup.hits[0].hit_count, expected);
    }

    assert_eq!(cache.stats().await.unwrap().total_hits, 3);
}

#[tokio::test]
async fn count_fresh_does_not_bump_counters() {
    let cache = EnrichmentCache::new(test_pool().await);
    cache.store(&record("123 Oak St"), 30).await.unwrap();

    let fresh = cache
        .count_fresh(&[address("123 Oak St"), address("456 Elm Ave")])
        .await
        .unwrap();
    assert_eq!(fresh, 1);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_hits, 0);
}

#[tokio::test]
async fn stored_record_is_never_flagged_cached_at_rest() {
    let pool = test_pool().await;
    let cache = EnrichmentCache::new(pool.clone());

    let mut r = record("123 Oak St");
    r.cached = true;
    cache.store(&r, 30).await.unwrap();

    let blob: String = sqlx::query_scalar("SELECT record FROM enrichment_cache")
        .fetch_one(&pool)
        .await
        .unwrap();
    let stored: PropertyRecord = serde_json::from_str(&blob).unwrap();
    assert!(!stored.cached);
}
