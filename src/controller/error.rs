//! Error types for the MongoCluster controller

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::crd::RecordError;
use crate::storage::StorageError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
/// This is idiomatic for error enums and improves readability at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Bad spec; surfaced immediately and never retried
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Network, storage, credential or exec failure
    #[error("Transient infrastructure error (will retry): {0}")]
    TransientInfraError(String),

    /// Operation would drop the replica set below majority
    #[error("Quorum risk: {0}")]
    QuorumRiskError(String),

    /// Archive is empty, corrupt or unreadable
    #[error("Data integrity error: {0}")]
    DataIntegrityError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Record error: {0}")]
    RecordError(#[from] RecordError),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::TransientInfraError(_) => true,
            Error::StorageError(e) => e.is_retryable(),
            Error::NotFound(_) => true,
            // Retried a bounded number of times by the restore path
            Error::DataIntegrityError(_) => true,
            Error::ValidationError(_) => false,
            Error::QuorumRiskError(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::RecordError(_) => false,
        }
    }

    /// Check if this error indicates the object no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    /// Short machine-readable class, used for condition reasons and metrics labels
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubeApi",
            Error::SerializationError(_) => "Serialization",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::NotFound(_) => "NotFound",
            Error::ValidationError(_) => "Validation",
            Error::TransientInfraError(_) => "TransientInfra",
            Error::QuorumRiskError(_) => "QuorumRisk",
            Error::DataIntegrityError(_) => "DataIntegrity",
            Error::StorageError(StorageError::Timeout(_)) => "TransientInfra",
            Error::StorageError(_) => "Storage",
            Error::RecordError(_) => "Record",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff used for the in-process retries around storage calls
    pub fn transient() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Larger exponents overflow to inf, which would turn into a zero delay
        let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        // Apply jitter
        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        // Cap at max delay
        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for a spec change; poll slowly meanwhile
            self.max_delay
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached
pub async fn retry_transient<T, F, Fut>(
    backoff: &BackoffConfig,
    max_attempts: u32,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(operation = what, attempt, error = %e, "retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Context for tracking error state during reconciliation
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ErrorContext {
    /// Record an error
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors += 1;
        self.last_error = Some(error.to_string());
    }

    /// Reset error tracking (called on successful reconciliation)
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }

    /// Check if we've exceeded max retries
    pub fn exceeded_max_retries(&self, max_retries: u32) -> bool {
        self.consecutive_errors >= max_retries
    }
}
