//! Cache-related error types

use thiserror::Error;

/// Cache operation errors
///
/// Misses, expired entries and best-effort I/O failures are not errors; they surface as
/// `None` from the read paths. This enum only covers conditions a caller can act on.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Invalid image data: {message}")]
    InvalidImage { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Record store error: {message}")]
    Store { message: String },

    #[error("Disk worker is no longer running")]
    WorkerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<config::ConfigError> for CacheError {
    fn from(err: config::ConfigError) -> Self {
        CacheError::Config {
            message: err.to_string(),
        }
    }
}

impl CacheError {
    /// Build an [`CacheError::InvalidKey`] for `key`
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Validate a key that may end up as a file name on disk
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key(key, "key is empty"));
    }
    if key.len() > 200 {
        return Err(CacheError::invalid_key(key, "key exceeds 200 bytes"));
    }
    if key.starts_with('.') {
        return Err(CacheError::invalid_key(key, "key must not start with '.'"));
    }
    if key.ends_with(".meta") {
        return Err(CacheError::invalid_key(key, "'.meta' suffix is reserved"));
    }
    if key
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        return Err(CacheError::invalid_key(
            key,
            "key contains a path separator or control character",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_accepts_plain_keys() {
        assert!(validate_key("overall_average").is_ok());
        assert!(validate_key("img_card-42.jpg").is_ok());
    }

    #[test]
    fn test_validate_key_rejects_malformed_keys() {
        assert!(validate_key("").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("entry.meta").is_err());
        assert!(validate_key(&"k".repeat(201)).is_err());
    }

    #[test]
    fn test_invalid_key_message() {
        let err = CacheError::invalid_key("a/b", "bad");
        assert_eq!(err.to_string(), "Invalid cache key 'a/b': bad");
    }
}
