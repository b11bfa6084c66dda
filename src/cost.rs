use crate::models::{CostEstimate, EnrichmentProvider};

/// Cost projection for a batch against a given provider.
///
/// Pure arithmetic: per-provider unit pricing times the uncached share of the
/// batch. Used both for the up-front cost-ceiling check and for
/// `estimate_only` dry runs, so it must never touch a provider or a store.
pub fn estimate(
    provider: EnrichmentProvider,
    total_addresses: usize,
    cached_results: usize,
) -> CostEstimate {
    let cached = cached_results.min(total_addresses);
    let new_lookups = total_addresses - cached;
    let unit = provider.cost_per_lookup();

    CostEstimate {
        provider,
        total_addresses: total_addresses as i64,
        cached_results: cached as i64,
        new_lookups: new_lookups as i64,
        cost_per_lookup: unit,
        total_cost: new_lookups as f64 * unit,
        cache_savings: cached as f64 * unit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_miss_batch_costs_unit_price_times_count() {
        let est = estimate(EnrichmentProvider::BatchData, 100, 0);
        assert_eq!(est.new_lookups, 100);
        assert_eq!(est.cached_results, 0);
        assert!((est.total_cost - 10.0).abs() < f64::EPSILON);
        assert!((est.cache_savings - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cache_hits_reduce_cost_and_count_as_savings() {
        let est = estimate(EnrichmentProvider::BatchData, 100, 40);
        assert_eq!(est.new_lookups, 60);
        assert!((est.total_cost - 6.0).abs() < 1e-9);
        assert!((est.cache_savings - 4.0).abs() < 1e-9);
    }

    #[test]
    fn all_cached_batch_is_free() {
        let est = estimate(EnrichmentProvider::Tracerfy, 25, 25);
        assert_eq!(est.new_lookups, 0);
        assert_eq!(est.total_cost, 0.0);
    }

    #[test]
    fn cached_count_is_clamped_to_total() {
        let est = estimate(EnrichmentProvider::Tracerfy, 10, 12);
        assert_eq!(est.cached_results, 10);
        assert_eq!(est.new_lookups, 0);
    }

    #[test]
    fn providers_price_differently() {
        let bd = estimate(EnrichmentProvider::BatchData, 10, 0);
        let tf = estimate(EnrichmentProvider::Tracerfy, 10, 0);
        assert!(bd.total_cost > tf.total_cost);
    }
}
