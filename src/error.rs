//! Error types for the SMS relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outcome of a failed channel call.
///
/// The variant decides retry behaviour: `ConfigInvalid` is never retried,
/// `Timeout` always is, `ProviderRejected` only when `permanent` is false.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Provider rejected ({status}): {reason}")]
    ProviderRejected {
        status: u16,
        reason: String,
        permanent: bool,
    },
}

impl DispatchError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConfigInvalid(_) => false,
            Self::Timeout(_) => true,
            Self::ProviderRejected { permanent, .. } => !permanent,
        }
    }

    /// Short label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::Timeout(_) => "timeout",
            Self::ProviderRejected { .. } => "provider_rejected",
        }
    }

    /// Build a rejection from an HTTP status, classifying permanence.
    ///
    /// 4xx is permanent except 408 (request timeout) and 429 (rate limited).
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        let permanent = (400..500).contains(&status) && status != 408 && status != 429;
        Self::ProviderRejected {
            status,
            reason: reason.into(),
            permanent,
        }
    }

    /// A call that exceeded its bound.
    pub fn elapsed(timeout: Duration) -> Self {
        Self::Timeout(format!("{}ms exceeded", timeout.as_millis()))
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("API key is missing or does not belong to endpoint {0}")]
    Unauthorized(String),

    #[error("Endpoint {0} is not active")]
    EndpointInactive(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Storage failed: {0}")]
    Storage(#[from] DatabaseError),
}

/// Errors returned by REST handlers. Mapped to HTTP status codes in `api`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}
