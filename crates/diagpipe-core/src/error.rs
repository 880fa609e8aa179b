//! Error types for diagpipe-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for diagpipe-core
#[derive(Error, Debug)]
pub enum Error {
    /// Pipeline lifecycle errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Diagnostic proxy errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Settings validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration file errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Diagnostic session boundary failures
    #[error("Session error: {0}")]
    Session(String),

    /// Expected event correlation did not complete (e.g. GC dump data)
    #[error("Incomplete data: {0}")]
    IncompleteData(String),

    /// Egress provider failures
    #[error("Egress error: {0}")]
    Egress(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

/// Pipeline lifecycle errors.
///
/// Cloneable so a shared run/stop handle can report the same outcome to
/// every concurrent caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Stop was requested before the pipeline ever started
    #[error("pipeline was not started")]
    NotStarted,

    /// The pipeline has already been disposed
    #[error("pipeline is disposed")]
    Disposed,

    /// The run was ended by cancellation
    #[error("pipeline run was cancelled")]
    Cancelled,

    /// The run body failed
    #[error("pipeline run failed: {0}")]
    Faulted(String),
}

/// Diagnostic proxy errors.
///
/// The runner's recovery policy matches on the two timeout variants; all
/// other variants are treated as transient accept failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Timed out waiting for the target runtime to connect on the front end
    #[error("timed out waiting for runtime connection on {endpoint}")]
    FrontendTimeout { endpoint: String },

    /// Timed out establishing the back-end tooling connection
    #[error("timed out connecting to back end {endpoint}")]
    BackendTimeout { endpoint: String },

    /// Accepting or pairing a connection failed
    #[error("connection pairing failed: {0}")]
    Accept(String),

    /// The proxy was stopped or the runner token was cancelled
    #[error("proxy cancelled")]
    Cancelled,

    /// Transport-level I/O failure
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    /// Name of the offending settings field
    pub field: String,
    /// Human-readable description of the violation
    pub message: String,
}

/// Aggregate of field-level validation failures.
///
/// Settings structs validate eagerly at construction time and report every
/// violation at once rather than failing at the moment of use.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render_failures(.failures))]
pub struct ValidationError {
    /// All detected violations, in field order
    pub failures: Vec<FieldFailure>,
}

impl ValidationError {
    /// Create a validation error from collected failures.
    ///
    /// Returns `Ok(())` when the list is empty so validators can end with
    /// `ValidationError::from_failures(failures)`.
    pub fn from_failures(failures: Vec<FieldFailure>) -> std::result::Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self { failures })
        }
    }
}

fn render_failures(failures: &[FieldFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    /// Config file is not valid TOML
    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },
}
