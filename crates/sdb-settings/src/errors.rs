//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building the settings tree.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The settings file is not JSON, or its values do not fit the schema.
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// The merged tree could not be converted back into settings.
    #[error("merged settings are malformed: {0}")]
    Merge(#[from] serde_json::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/sdb/settings.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let text = err.to_string();
        assert!(text.contains("/etc/sdb/settings.json"));
        assert!(text.contains("denied"));
    }

    #[test]
    fn merge_error_converts_from_serde() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err = SettingsError::from(json_err);
        assert!(err.to_string().starts_with("merged settings are malformed"));
    }
}
