use crate::address::hash_address;
use crate::circuit_breaker::{create_provider_circuit_breaker, ProviderCircuitBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{
    AddressInput, EnrichmentErrorType, EnrichmentOptions, EnrichmentProvider, PropertyRecord,
    ProviderOutcome,
};
use crate::quality;
use chrono::Utc;
use failsafe::futures::CircuitBreaker as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Transport knobs passed down to a provider for one batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Addresses per remote sub-batch.
    pub batch_size: usize,
    /// Pacing delay between sub-batches (and between poll attempts), in
    /// milliseconds. A deliberate rate-limiting wait, not incidental.
    pub delay_ms: u64,
    /// Transient-failure retries per sub-batch, or poll attempts for
    /// asynchronous providers.
    pub max_retries: u32,
}

impl From<&EnrichmentOptions> for BatchOptions {
    fn from(opts: &EnrichmentOptions) -> Self {
        Self {
            batch_size: opts.batch_size.max(1),
            delay_ms: opts.delay_ms,
            max_retries: opts.max_retries,
        }
    }
}

// ============ Payload extraction ============

fn opt_str(v: &Value, section: &str, key: &str) -> Option<String> {
    v.get(section)
        .and_then(|s| s.get(key))
        .and_then(|x| x.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

fn opt_f64(v: &Value, section: &str, key: &str) -> Option<f64> {
    let field = v.get(section).and_then(|s| s.get(key))?;
    // Providers are inconsistent about numbers-as-strings.
    field
        .as_f64()
        .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))
}

fn opt_i64(v: &Value, section: &str, key: &str) -> Option<i64> {
    let field = v.get(section).and_then(|s| s.get(key))?;
    field
        .as_i64()
        .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Builds an annotated `PropertyRecord` from one per-address provider payload.
///
/// The payload bag is kept verbatim in `raw_payload`; typed fields are
/// extracted best-effort and feed the derived quality metrics.
pub fn record_from_payload(
    provider: EnrichmentProvider,
    address: &AddressInput,
    payload: &Value,
) -> PropertyRecord {
    let mut record = PropertyRecord {
        provider,
        address_hash: hash_address(address),
        address: address.clone(),
        owner_name: opt_str(payload, "owner", "name"),
        owner_phone: opt_str(payload, "owner", "phone"),
        owner_email: opt_str(payload, "owner", "email"),
        year_built: opt_i64(payload, "building", "year_built").map(|y| y as i32),
        square_footage: opt_i64(payload, "building", "square_feet"),
        bedrooms: opt_i64(payload, "building", "bedrooms").map(|b| b as i32),
        bathrooms: opt_f64(payload, "building", "bathrooms"),
        lot_size_acres: opt_f64(payload, "building", "lot_acres"),
        assessed_value: opt_f64(payload, "valuation", "assessed_value"),
        market_value: opt_f64(payload, "valuation", "market_value"),
        last_sale_price: opt_f64(payload, "valuation", "last_sale_price"),
        roof_type: opt_str(payload, "roof", "material"),
        roof_age_years: opt_i64(payload, "roof", "age_years").map(|a| a as i32),
        roof_condition: opt_str(payload, "roof", "condition"),
        raw_payload: payload.clone(),
        quality_score: 0,
        data_completeness: 0,
        cached: false,
        enriched_at: Utc::now(),
        expires_at: None,
        hit_count: 0,
    };
    quality::annotate(&mut record);
    record
}

fn address_body(address: &AddressInput) -> Value {
    json!({
        "street": address.street,
        "city": address.city,
        "state": address.state,
        "zip": address.zip,
        "unit": address.unit,
    })
}

/// Maps one entry of a provider result array onto an outcome for the address
/// submitted at the same position.
fn outcome_from_entry(
    provider: EnrichmentProvider,
    address: &AddressInput,
    entry: Option<&Value>,
) -> ProviderOutcome {
    let Some(entry) = entry else {
        return ProviderOutcome::failure(
            address,
            EnrichmentErrorType::ApiError,
            "provider returned no result for this address",
            0,
        );
    };

    match entry.get("status").and_then(|s| s.as_str()) {
        Some("success") => {
            let payload = entry.get("data").cloned().unwrap_or_else(|| json!({}));
            ProviderOutcome::Enriched(Box::new(record_from_payload(provider, address, &payload)))
        }
        Some("no_match") => ProviderOutcome::failure(
            address,
            EnrichmentErrorType::InvalidAddress,
            "no property matched this address",
            0,
        ),
        other => ProviderOutcome::failure(
            address,
            EnrichmentErrorType::ApiError,
            format!(
                "provider error: {}",
                entry
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or(other.unwrap_or("unknown"))
            ),
            0,
        ),
    }
}

// ============ BatchData: synchronous batch provider ============

/// Synchronous-batch skip-trace client.
///
/// Chunks the input into sub-batches, paces between them, retries a sub-batch
/// on transport failure, and degrades an exhausted sub-batch to per-address
/// failures rather than aborting the batch.
#[derive(Clone)]
pub struct BatchDataClient {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: ProviderCircuitBreaker,
}

impl BatchDataClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create BatchData client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            breaker: create_provider_circuit_breaker(),
        })
    }

    pub async fn enrich_batch(
        &self,
        addresses: &[AddressInput],
        opts: &BatchOptions,
    ) -> Vec<ProviderOutcome> {
        let mut outcomes = Vec::with_capacity(addresses.len());

        for (i, chunk) in addresses.chunks(opts.batch_size).enumerate() {
            if i > 0 && opts.delay_ms > 0 {
                // Deliberate pacing against the provider's rate limit.
                tokio::time::sleep(Duration::from_millis(opts.delay_ms)).await;
            }
            outcomes.extend(self.enrich_chunk_with_retry(chunk, opts).await);
        }

        outcomes
    }

    async fn enrich_chunk_with_retry(
        &self,
        chunk: &[AddressInput],
        opts: &BatchOptions,
    ) -> Vec<ProviderOutcome> {
        let mut attempt: u32 = 0;
        loop {
            match self.call_chunk(chunk).await {
                Ok(outcomes) => return outcomes,
                Err(e) if attempt < opts.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "BatchData sub-batch failed (attempt {}/{}): {}",
                        attempt,
                        opts.max_retries,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(opts.delay_ms * u64::from(attempt)))
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        "BatchData sub-batch exhausted {} retries: {}",
                        opts.max_retries,
                        e
                    );
                    return chunk
                        .iter()
                        .map(|a| {
                            ProviderOutcome::failure(
                                a,
                                EnrichmentErrorType::ApiError,
                                e.to_string(),
                                attempt,
                            )
                        })
                        .collect();
                }
            }
        }
    }

    async fn call_chunk(&self, chunk: &[AddressInput]) -> Result<Vec<ProviderOutcome>, AppError> {
        let url = format!("{}/api/v1/property/skip-trace", self.base_url);
        let body = json!({
            "requests": chunk.iter().map(address_body).collect::<Vec<_>>(),
        });

        tracing::debug!("BatchData: submitting sub-batch of {}", chunk.len());

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send();

        let response = self.breaker.call(request).await.map_err(|e| match e {
            failsafe::Error::Inner(e) => {
                AppError::ExternalApiError(format!("BatchData request failed: {}", e))
            }
            failsafe::Error::Rejected => {
                AppError::ExternalApiError("BatchData circuit breaker open".to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "BatchData returned status {}: {}",
                status, error_text
            )));
        }

        let parsed: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse BatchData response: {}", e))
        })?;

        let results = parsed
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        // Results are positional; a short array degrades the tail to failures
        // so every submitted address appears exactly once in the output.
        Ok(chunk
            .iter()
            .enumerate()
            .map(|(i, address)| {
                outcome_from_entry(EnrichmentProvider::BatchData, address, results.get(i))
            })
            .collect())
    }
}

// ============ Tracerfy: asynchronous poll provider ============

/// Submit-and-poll skip-trace client.
///
/// Submits the whole batch as one remote job, then polls for completion up to
/// `max_retries` attempts. A terminal remote failure or poll exhaustion
/// becomes per-address failures.
#[derive(Clone)]
pub struct TracerfyClient {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: ProviderCircuitBreaker,
}

impl TracerfyClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Tracerfy client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            breaker: create_provider_circuit_breaker(),
        })
    }

    pub async fn enrich_batch(
        &self,
        addresses: &[AddressInput],
        opts: &BatchOptions,
    ) -> Vec<ProviderOutcome> {
        match self.submit_and_poll(addresses, opts).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::error!("Tracerfy batch failed: {}", e);
                addresses
                    .iter()
                    .map(|a| {
                        ProviderOutcome::failure(
                            a,
                            EnrichmentErrorType::ApiError,
                            e.to_string(),
                            opts.max_retries,
                        )
                    })
                    .collect()
            }
        }
    }

    async fn submit_and_poll(
        &self,
        addresses: &[AddressInput],
        opts: &BatchOptions,
    ) -> Result<Vec<ProviderOutcome>, AppError> {
        let remote_id = self.submit(addresses).await?;
        tracing::info!(
            "Tracerfy: submitted batch of {} as remote job {}",
            addresses.len(),
            remote_id
        );

        let poll_interval = Duration::from_millis(opts.delay_ms.max(250));

        for attempt in 0..=opts.max_retries {
            tokio::time::sleep(poll_interval).await;

            let status = self.poll(&remote_id).await?;
            match status.get("status").and_then(|s| s.as_str()) {
                Some("completed") => {
                    let results = status
                        .get("results")
                        .and_then(|r| r.as_array())
                        .cloned()
                        .unwrap_or_default();
                    return Ok(addresses
                        .iter()
                        .enumerate()
                        .map(|(i, address)| {
                            outcome_from_entry(
                                EnrichmentProvider::Tracerfy,
                                address,
                                results.get(i),
                            )
                        })
                        .collect());
                }
                Some("failed") => {
                    let reason = status
                        .get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("remote job failed");
                    return Err(AppError::ExternalApiError(format!(
                        "Tracerfy job {} failed: {}",
                        remote_id, reason
                    )));
                }
                _ => {
                    tracing::debug!(
                        "Tracerfy job {} still pending (poll {}/{})",
                        remote_id,
                        attempt + 1,
                        opts.max_retries + 1
                    );
                }
            }
        }

        Err(AppError::ExternalApiError(format!(
            "Tracerfy job {} did not complete within {} polls",
            remote_id,
            opts.max_retries + 1
        )))
    }

    async fn submit(&self, addresses: &[AddressInput]) -> Result<String, AppError> {
        let url = format!("{}/v1/trace/batch", self.base_url);
        let body = json!({
            "addresses": addresses.iter().map(address_body).collect::<Vec<_>>(),
        });

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send();

        let response = self.breaker.call(request).await.map_err(|e| match e {
            failsafe::Error::Inner(e) => {
                AppError::ExternalApiError(format!("Tracerfy submit failed: {}", e))
            }
            failsafe::Error::Rejected => {
                AppError::ExternalApiError("Tracerfy circuit breaker open".to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Tracerfy returned status {}: {}",
                status, error_text
            )));
        }

        let parsed: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Tracerfy response: {}", e))
        })?;

        parsed
            .get("job_id")
            .and_then(|id| id.as_str())
            .map(String::from)
            .ok_or_else(|| {
                AppError::ExternalApiError("Tracerfy response missing 'job_id'".to_string())
            })
    }

    async fn poll(&self, remote_id: &str) -> Result<Value, AppError> {
        let url = format!("{}/v1/trace/batch/{}", self.base_url, remote_id);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Tracerfy poll failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApiError(format!(
                "Tracerfy poll returned status {}",
                response.status()
            )));
        }

        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Tracerfy poll response: {}", e))
        })
    }
}

// ============ Dispatch ============

/// One configured provider client. Closed enum dispatch: adding a provider
/// means adding a variant here and a constructor in the factory.
#[derive(Clone)]
pub enum ProviderClient {
    BatchData(BatchDataClient),
    Tracerfy(TracerfyClient),
}

impl ProviderClient {
    /// Enriches a batch of addresses. Exactly one outcome per input address;
    /// transport failures surface as per-address `api_error` outcomes, never
    /// as an aborted batch.
    pub async fn enrich_batch(
        &self,
        addresses: &[AddressInput],
        opts: &BatchOptions,
    ) -> Vec<ProviderOutcome> {
        match self {
            ProviderClient::BatchData(client) => client.enrich_batch(addresses, opts).await,
            ProviderClient::Tracerfy(client) => client.enrich_batch(addresses, opts).await,
        }
    }
}

/// Owns the provider clients for one orchestrator instance.
///
/// Clients are constructed eagerly from configuration; a provider without
/// credentials simply has no client and resolves to `ProviderNotConfigured`.
pub struct ProviderFactory {
    batchdata: Option<ProviderClient>,
    tracerfy: Option<ProviderClient>,
}

impl ProviderFactory {
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let batchdata = match &config.batchdata_api_key {
            Some(key) => Some(ProviderClient::BatchData(BatchDataClient::new(
                config.batchdata_base_url.clone(),
                key.clone(),
            )?)),
            None => None,
        };

        let tracerfy = match &config.tracerfy_api_key {
            Some(key) => Some(ProviderClient::Tracerfy(TracerfyClient::new(
                config.tracerfy_base_url.clone(),
                key.clone(),
            )?)),
            None => None,
        };

        Ok(Self { batchdata, tracerfy })
    }

    /// Resolves the client for a provider, or `ProviderNotConfigured`.
    pub fn client_for(&self, provider: EnrichmentProvider) -> Result<&ProviderClient, AppError> {
        let client = match provider {
            EnrichmentProvider::BatchData => self.batchdata.as_ref(),
            EnrichmentProvider::Tracerfy => self.tracerfy.as_ref(),
        };
        client.ok_or_else(|| AppError::ProviderNotConfigured(provider.as_str().to_string()))
    }
}
