use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ Providers ============

/// Closed set of supported enrichment data providers.
///
/// Selection is by enum, not by string matching; each variant carries its own
/// unit pricing and maps to one configured client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentProvider {
    /// Synchronous batch skip-trace provider.
    BatchData,
    /// Asynchronous submit-and-poll skip-trace provider.
    Tracerfy,
}

impl EnrichmentProvider {
    /// Stable lowercase name used in persistence and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentProvider::BatchData => "batchdata",
            EnrichmentProvider::Tracerfy => "tracerfy",
        }
    }

    /// Dollar cost per new (uncached) lookup for this provider.
    pub fn cost_per_lookup(&self) -> f64 {
        match self {
            EnrichmentProvider::BatchData => 0.10,
            EnrichmentProvider::Tracerfy => 0.05,
        }
    }
}

impl fmt::Display for EnrichmentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batchdata" => Ok(EnrichmentProvider::BatchData),
            "tracerfy" => Ok(EnrichmentProvider::Tracerfy),
            other => Err(format!("unknown enrichment provider: {}", other)),
        }
    }
}

// ============ Addresses ============

/// Raw caller-supplied address. Input only, never persisted directly;
/// persistence keys off the derived address hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInput {
    /// Street line, e.g. "123 Oak St".
    pub street: String,
    /// City name.
    pub city: String,
    /// Two-letter state code.
    pub state: String,
    /// 5-digit ZIP, optionally ZIP+4.
    pub zip: String,
    /// Optional unit/apartment designator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AddressInput {
    /// Single-line rendering for logs and error echoes.
    pub fn one_line(&self) -> String {
        match &self.unit {
            Some(unit) => format!(
                "{} {}, {}, {} {}",
                self.street, unit, self.city, self.state, self.zip
            ),
            None => format!("{}, {}, {} {}", self.street, self.city, self.state, self.zip),
        }
    }
}

// ============ Enrichment results ============

/// One enriched property as returned by a provider or reconstructed from the
/// cache.
///
/// `quality_score` and `data_completeness` are derived metrics: they are
/// recomputed whenever a record is read back from storage, never trusted from
/// the stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// Provider that produced this record.
    pub provider: EnrichmentProvider,
    /// Deterministic fingerprint of the normalized address; cache primary key.
    pub address_hash: String,
    /// Echo of the input address.
    pub address: AddressInput,
    /// Owner full name.
    pub owner_name: Option<String>,
    /// Best owner phone number.
    pub owner_phone: Option<String>,
    /// Best owner email address.
    pub owner_email: Option<String>,
    /// Year the structure was built.
    pub year_built: Option<i32>,
    /// Finished square footage.
    pub square_footage: Option<i64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    /// Lot size in acres.
    pub lot_size_acres: Option<f64>,
    /// County-assessed value in dollars.
    pub assessed_value: Option<f64>,
    /// Estimated market value in dollars.
    pub market_value: Option<f64>,
    /// Most recent sale price, if known.
    pub last_sale_price: Option<f64>,
    /// Roof covering material, e.g. "asphalt_shingle".
    pub roof_type: Option<String>,
    /// Estimated roof age in years.
    pub roof_age_years: Option<i32>,
    /// Provider-reported roof condition, e.g. "fair".
    pub roof_condition: Option<String>,
    /// Free-form provider payload kept verbatim for downstream consumers.
    pub raw_payload: Value,
    /// Derived 0-100 quality score (recomputed on read).
    pub quality_score: u8,
    /// Derived 0-100 completeness score (recomputed on read).
    pub data_completeness: u8,
    /// Whether this record was served from the cache.
    pub cached: bool,
    /// When the provider produced this record.
    pub enriched_at: DateTime<Utc>,
    /// Cache expiry; absent on a fresh provider result that has not been stored yet.
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of cache hits this record has served.
    pub hit_count: i64,
}

/// Classification of a per-address enrichment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentErrorType {
    /// Address could not be matched, or the match fell below the caller's
    /// quality bar.
    InvalidAddress,
    /// Provider/network failure.
    ApiError,
    /// Match was genuine but missing a caller-required owner contact field.
    QualityRejected,
}

impl EnrichmentErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentErrorType::InvalidAddress => "invalid_address",
            EnrichmentErrorType::ApiError => "api_error",
            EnrichmentErrorType::QualityRejected => "quality_rejected",
        }
    }
}

/// One failed address inside a job. Accumulated, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentError {
    /// Echo of the input address.
    pub address: AddressInput,
    pub error_type: EnrichmentErrorType,
    pub error_message: String,
    /// Structured details, e.g. quality score vs. configured minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// How many retries were spent before giving up.
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Per-address provider result: success with data XOR failure with error.
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    Enriched(Box<PropertyRecord>),
    Failed(EnrichmentError),
}

impl ProviderOutcome {
    /// Builds a failure outcome echoing the given address.
    pub fn failure(
        address: &AddressInput,
        error_type: EnrichmentErrorType,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        ProviderOutcome::Failed(EnrichmentError {
            address: address.clone(),
            error_type,
            error_message: message.into(),
            details: None,
            retry_count,
            timestamp: Utc::now(),
        })
    }
}

// ============ Jobs ============

/// Job lifecycle states. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Terminal payload of a completed job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResults {
    /// Successful records, cache hits included.
    pub results: Vec<PropertyRecord>,
    /// Structured per-address failures.
    pub errors: Vec<EnrichmentError>,
    /// Mean quality score across successful records.
    pub average_quality_score: f64,
    /// Mean completeness across successful records.
    pub average_completeness: f64,
}

/// Durable record of one batch submission. Created once per submission and
/// mutated incrementally as chunks complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub id: Uuid,
    pub tenant_id: String,
    pub targeting_area_id: Option<String>,
    pub provider: EnrichmentProvider,
    pub status: JobStatus,
    pub total_items: i64,
    pub processed_items: i64,
    pub successful_items: i64,
    pub failed_items: i64,
    /// Addresses satisfied from the cache at submission time.
    pub cached_count: i64,
    /// Estimate computed at submission time, kept for the caller projection.
    pub cost_estimate: Option<CostEstimate>,
    /// Dollars actually spent, recorded when the job goes terminal.
    pub actual_cost: Option<f64>,
    /// Terminal results payload; absent until completed.
    pub results: Option<JobResults>,
    /// Failure message when status is `failed`.
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Heartbeat; bumped on every durable checkpoint.
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
}

// ============ Caller-facing API shapes ============

/// Tuning knobs for one batch submission. All fields have conservative
/// defaults so `{}` is a valid options object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentOptions {
    /// Consult the cache before calling the provider.
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Treat every address as a miss even if cached.
    #[serde(default)]
    pub force_refresh: bool,
    /// Dry run: compute the estimate, touch nothing.
    #[serde(default)]
    pub estimate_only: bool,
    /// Reject the submission outright if the estimate exceeds this many dollars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_dollars: Option<f64>,
    /// Addresses per provider chunk.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pacing delay between provider sub-batches, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Transient-failure retries per provider sub-batch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Reject successful results scoring below this 0-100 threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality_score: Option<u8>,
    /// Reject successful results with no owner phone.
    #[serde(default)]
    pub require_owner_phone: bool,
    /// Reject successful results with no owner email.
    #[serde(default)]
    pub require_owner_email: bool,
    /// Cache TTL override in days for results produced by this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_days: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_delay_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            force_refresh: false,
            estimate_only: false,
            max_cost_dollars: None,
            batch_size: default_batch_size(),
            delay_ms: default_delay_ms(),
            max_retries: default_max_retries(),
            min_quality_score: None,
            require_owner_phone: false,
            require_owner_email: false,
            cache_ttl_days: None,
        }
    }
}

/// One batch enrichment submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnrichmentRequest {
    pub addresses: Vec<AddressInput>,
    pub provider: EnrichmentProvider,
    /// Optional campaign targeting area this batch belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_area_id: Option<String>,
    #[serde(default)]
    pub options: EnrichmentOptions,
}

/// Pure computed cost projection for a batch. Derived fresh per request,
/// never persisted as a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub provider: EnrichmentProvider,
    pub total_addresses: i64,
    /// Addresses satisfied from the cache.
    pub cached_results: i64,
    /// Addresses that will hit the paid provider.
    pub new_lookups: i64,
    pub cost_per_lookup: f64,
    /// `new_lookups * cost_per_lookup`.
    pub total_cost: f64,
    /// Dollars avoided thanks to cache hits.
    pub cache_savings: f64,
}

/// The envelope every caller sees, for both real jobs and synthetic
/// (estimate-only / all-cached) completions.
///
/// `job_id` is `None` when no job row was created, so callers cannot poll an
/// identifier that does not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnrichmentResult {
    pub job_id: Option<Uuid>,
    pub status: JobStatus,
    pub total_addresses: i64,
    pub processed_count: i64,
    pub successful_count: i64,
    pub failed_count: i64,
    pub cached_count: i64,
    pub results: Vec<PropertyRecord>,
    pub errors: Vec<EnrichmentError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost_estimate: Option<CostEstimate>,
    pub actual_cost: Option<f64>,
}
