//! Error types for the atlas

use thiserror::Error;

/// Result type for atlas operations
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Atlas errors
#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Schema inconsistency: {kind}.{field} references missing kind '{target}'")]
    SchemaInconsistency {
        kind: String,
        field: String,
        target: String,
    },

    #[error("Cannot delete customization {id}: blocked by {}", .blockers.join(", "))]
    DependencyConflict { id: String, blockers: Vec<String> },

    #[error("Derivation cycle: {}", .path.join(" -> "))]
    DerivationCycle { path: Vec<String> },

    #[error("Customization dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("{what} '{name}' not found{}", format_suggestions(.suggestions))]
    NotFound {
        what: &'static str,
        name: String,
        suggestions: Vec<String>,
    },

    #[error("Permission denied: {caller} may not {action} {kind}")]
    PermissionDenied {
        caller: String,
        kind: String,
        action: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Cleanup failed for {kind} record {record_id}: {reason}")]
    CleanupFailure {
        kind: String,
        record_id: String,
        reason: String,
    },

    #[error("Invalid transition: cannot {action} customization {id} in state {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: String,
    },

    #[error("Concurrent modification of {kind}: expected version {expected}, found {actual}")]
    StaleVersion {
        kind: String,
        expected: u64,
        actual: u64,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

impl AtlasError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        AtlasError::NotFound {
            what,
            name: name.into(),
            suggestions: Vec::new(),
        }
    }

    /// Wrap a failure reported by an external collaborator
    pub fn collaborator(err: anyhow::Error) -> Self {
        AtlasError::Collaborator(format!("{:#}", err))
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(". Did you mean: {}", suggestions.join(", "))
    }
}
