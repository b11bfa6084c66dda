//! Property Enrichment API Library
//!
//! Core functionality for the property enrichment queue: address
//! fingerprinting, data-quality scoring, cost estimation, provider clients,
//! the persistent enrichment cache, the durable job store, and the batch
//! orchestrator.
//!
//! # Modules
//!
//! - `address`: Address normalization, hashing, and validation.
//! - `cache`: Persistent TTL cache keyed by address hash.
//! - `circuit_breaker`: Circuit breaker for paid provider calls.
//! - `config`: Configuration management.
//! - `cost`: Cost estimation.
//! - `db`: Database connection, pool, and schema management.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `job_store`: Durable job persistence.
//! - `models`: Core data models.
//! - `providers`: Enrichment provider clients and dispatch.
//! - `quality`: Record quality and completeness scoring.
//! - `queue`: Batch enrichment orchestration.

pub mod address;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod cost;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod job_store;
pub mod models;
pub mod providers;
pub mod quality;
pub mod queue;
