//! Error types for switchboard.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

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
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// SMS/voice transport errors. Always caught at the call site and recorded
/// in the relevant log row; never allowed to fail a webhook response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SMS send to {to} failed: {reason}")]
    SmsSendFailed { to: String, reason: String },

    #[error("Call creation to {to} failed: {reason}")]
    CallCreateFailed { to: String, reason: String },

    #[error("Provider request failed: {0}")]
    Http(String),

    #[error("Provider response invalid: {0}")]
    InvalidResponse(String),
}

/// Number/owner resolution failures. These are expected outcomes of the
/// fallback chains, not faults — callers branch on the variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Requested number is inactive or released")]
    NumberUnavailable,

    #[error("Requested number is assigned to another user")]
    NumberNotAssigned,

    #[error("Requested number belongs to an agency the user is not in")]
    NumberNotAccessible,

    #[error("No number could be resolved for the user or agency")]
    NoNumberAvailable,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
