use failsafe::{backoff, failure_policy, Config};
use std::time::Duration;

/// Concrete breaker type shared by provider clients. Cloning shares state, so
/// all calls through one provider client trip the same breaker.
pub type ProviderCircuitBreaker = failsafe::StateMachine<
    failure_policy::ConsecutiveFailures<backoff::Exponential>,
    (),
>;

/// Creates a circuit breaker for paid provider calls.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, requests pass through.
/// - **OPEN**: Too many failures, requests fail fast without spending money.
/// - **HALF_OPEN**: Testing if the provider recovered.
///
/// An open circuit is reported per-address as an `api_error`, never as a
/// batch-level exception.
pub fn create_provider_circuit_breaker() -> ProviderCircuitBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}
