//! Error types for jobmail.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Pattern store load failures. Always fatal for a run: proceeding with
/// empty rules would label everything `other`.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Failed to read pattern file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pattern document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid regex in '{key}': {pattern} ({source})")]
    InvalidRegex {
        key: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Pattern document defines no label rules")]
    Empty,

    #[error("Label '{0}' is the fallback and cannot carry rules")]
    UnruledLabel(String),
}

/// Per-message extraction failures. The message is skipped and reported,
/// the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Malformed message {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Message {id} has no readable body")]
    MissingBody { id: String },
}

/// Statistical classifier errors. Recoverable: the pipeline falls back to
/// rule output.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Storage failed: {0}")]
    Storage(#[from] DatabaseError),
}
