//! Error types for the Tollgate policy engine.

use thiserror::Error;

use crate::auth::expr::ExprError;

/// Main error type for Tollgate operations.
///
/// Every variant is raised while a policy is being loaded or compiled.
/// Request-time failures are folded into verdicts and never surface here.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Two rules could be selected for the same request with no way to order them
    #[error("Configuration ambiguity: {0}")]
    ConfigurationAmbiguity(String),

    /// A rate limit descriptor or action that can never produce a usable entry
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Boolean expression errors
    #[error("Boolean expression error: {0}")]
    Expression(#[from] ExprError),

    /// Rate limits keyed on auth state configured to run before auth
    #[error("Auth ordering conflict: {0}")]
    AuthOrderingConflict(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML decoding errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
