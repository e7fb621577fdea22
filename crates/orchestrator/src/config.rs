//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

/// Orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `TRANSACTION_LOCK_TTL_SECONDS` — resource lock TTL (default: `30`)
/// - `IDEMPOTENCY_TTL_SECONDS` — idempotency binding TTL (default: `3600`)
/// - `COMPENSATION_RETENTION_SECONDS` — compensation failure record
///   retention (default: 7 days)
/// - `SAGA_QUEUE_ATTEMPTS` — queue-level attempt budget per saga
///   (default: `1`; saga retries go through operator requeue from the
///   quarantine, not blind queue redelivery)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lock_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub compensation_retention: Duration,
    pub queue_attempts: u32,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_ttl: secs_from_env("TRANSACTION_LOCK_TTL_SECONDS", defaults.lock_ttl),
            idempotency_ttl: secs_from_env("IDEMPOTENCY_TTL_SECONDS", defaults.idempotency_ttl),
            compensation_retention: secs_from_env(
                "COMPENSATION_RETENTION_SECONDS",
                defaults.compensation_retention,
            ),
            queue_attempts: std::env::var("SAGA_QUEUE_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_attempts),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(3600),
            compensation_retention: Duration::from_secs(7 * 24 * 3600),
            queue_attempts: 1,
        }
    }
}

fn secs_from_env(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
