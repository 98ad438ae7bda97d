//! Guard error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the permission and sandbox subsystem
///
/// Configuration and load errors abort construction of the owning component.
/// None of them has a permissive fallback.
#[derive(Error, Debug)]
pub enum GuardError {
    /// One or both permission profiles could not be found
    #[error(
        "Permission profile not found (expected system profile at {} and user profile at {})",
        system.display(),
        user.display()
    )]
    ProfileNotFound { system: PathBuf, user: PathBuf },

    /// A profile file exists but does not follow the profile schema
    #[error("Invalid profile {}: {reason}", path.display())]
    InvalidProfile { path: PathBuf, reason: String },

    /// The dangerous-pattern corpus could not be loaded
    #[error("Failed to load dangerous command patterns: {0}")]
    PatternsLoadFailure(String),

    /// The sandbox tool binary could not be located
    #[error("Sandbox tool unavailable: {0}")]
    SandboxToolUnavailable(String),

    /// Configured mount sources do not exist on the host
    #[error("Sandbox mount source(s) missing: {}", format_paths(.0))]
    MountSourceMissing(Vec<PathBuf>),

    /// A mount specification is malformed or still carries a placeholder
    #[error("Invalid sandbox mount: {0}")]
    InvalidMount(String),

    /// A tool call attempted to switch the sandbox off
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Session context cannot be bound to the user profile
    #[error("Invalid session context: {0}")]
    InvalidSession(String),

    /// Configuration value is missing or out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tool input could not be interpreted
    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GuardError {
    /// Create an invalid-profile error
    pub fn invalid_profile(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        GuardError::InvalidProfile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a pattern load failure
    pub fn patterns(msg: impl Into<String>) -> Self {
        GuardError::PatternsLoadFailure(msg.into())
    }

    /// Whether this error must stop the owning run outright
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            GuardError::MountSourceMissing(_) | GuardError::InvalidToolInput(_)
        )
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_not_found_names_both_sources() {
        let err = GuardError::ProfileNotFound {
            system: PathBuf::from("/etc/agent/system.yaml"),
            user: PathBuf::from("/etc/agent/user.yaml"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/agent/system.yaml"));
        assert!(msg.contains("/etc/agent/user.yaml"));
    }

    #[test]
    fn test_mount_source_missing_lists_paths() {
        let err = GuardError::MountSourceMissing(vec![
            PathBuf::from("/missing/a"),
            PathBuf::from("/missing/b"),
        ]);
        assert_eq!(
            err.to_string(),
            "Sandbox mount source(s) missing: /missing/a, /missing/b"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let guard_err: GuardError = io_err.into();
        assert!(matches!(guard_err, GuardError::Io(_)));
        assert!(guard_err.is_fatal());
    }
}
