//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source store connection or query error
    #[error("Source store error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Destination store connection or query error
    #[error("Destination store error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A node could not be converted to the destination shape.
    #[error("Bad content at {path}: {message}")]
    Translate { path: String, message: String },

    /// The source produced a node variant the destination cannot represent.
    #[error("Unsupported node type '{kind}' at {path}")]
    UnsupportedNode { path: String, kind: String },

    /// A targeted top-level node does not exist in the source.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// The producer side of a job pipeline stopped without signalling end-of-stream.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// A subtree migration job failed.
    #[error("Job failed for {container}: {message}")]
    Job { container: String, message: String },

    /// Deletion replay failed; the last persisted checkpoint is still valid.
    #[error("Deletion replay failed: {0}")]
    Replay(String),

    /// In-memory store failure (tests and rehearsals).
    #[error("Store error: {0}")]
    Store(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Translate error for the node at `path`.
    pub fn translate(path: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Translate {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a Job error
    pub fn job(container: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Job {
            container: container.into(),
            message: message.into(),
        }
    }

    /// True for errors that only invalidate the current node/subtree.
    pub fn is_per_job(&self) -> bool {
        matches!(
            self,
            MigrateError::Translate { .. }
                | MigrateError::UnsupportedNode { .. }
                | MigrateError::Pipeline(_)
                | MigrateError::Job { .. }
        )
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::NodeNotFound(_) => 2,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => 3,
            MigrateError::Translate { .. }
            | MigrateError::UnsupportedNode { .. }
            | MigrateError::Pipeline(_)
            | MigrateError::Job { .. } => 4,
            MigrateError::Replay(_) => 5,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_category() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::pool("x", "y").exit_code(), 3);
        assert_eq!(MigrateError::translate("/a", "bad").exit_code(), 4);
        assert_eq!(MigrateError::Replay("x".into()).exit_code(), 5);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_per_job_classification() {
        assert!(MigrateError::translate("/a/b", "bad uri").is_per_job());
        assert!(MigrateError::job("a", "boom").is_per_job());
        assert!(!MigrateError::Config("x".into()).is_per_job());
        assert!(!MigrateError::Replay("x".into()).is_per_job());
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = MigrateError::translate("/home/x", "invalid timestamp");
        let out = err.format_detailed();
        assert!(out.contains("/home/x"));
        assert!(out.contains("invalid timestamp"));
    }
}
