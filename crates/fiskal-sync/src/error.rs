//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Upstream     │  │      Issuance           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Upstream{..}   │  │  NumberingConflict      │ │
//! │  │  InvalidUrl     │  │  Http           │  │  InvalidRequest         │ │
//! │  │  ConfigLoad     │  │  Auth           │  │  Core                   │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │  Serialization  │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An enrichment step that finds nothing and an issuance that hits an
//! existing receipt are outcomes, not errors; see
//! [`crate::enrichment::EnrichmentOutcome`] and
//! [`crate::issuance::IssueOutcome`].

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Bodies longer than this are cut when written to logs.
pub const MAX_LOG_BODY_CHARS: usize = 512;

/// Sync error type covering all sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid upstream URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// No tenant with this id is configured.
    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// Non-2xx response from the upstream API. `body` is kept whole.
    #[error("Upstream returned {status}: {}", truncate_body(.body))]
    Upstream { status: u16, body: String },

    /// Transport failure (DNS, TLS, timeout, connection reset).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token grant failed or returned no usable token.
    #[error("Authentication failed: {0}")]
    Auth(String),

    // =========================================================================
    // Storage and Issuance Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] fiskal_db::DbError),

    /// Two issuances allocated the same receipt number and the retry lost too.
    #[error("Receipt numbering conflict for tenant {tenant_id}")]
    NumberingConflict { tenant_id: String },

    /// The caller asked for something the current state does not allow.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Domain rule violation.
    #[error(transparent)]
    Core(#[from] fiskal_core::CoreError),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// JSON encode/decode failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Cuts a response body to [`MAX_LOG_BODY_CHARS`] characters.
pub fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_LOG_BODY_CHARS {
        return body.to_string();
    }
    let mut preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
    preview.push_str("...");
    preview
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fiskal_core::ValidationError> for SyncError {
    fn from(err: fiskal_core::ValidationError) -> Self {
        SyncError::Core(err.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Shorthand for an upstream non-2xx response.
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        SyncError::Upstream {
            status,
            body: body.into(),
        }
    }

    /// Returns true if re-invoking the sync later may succeed.
    ///
    /// Nothing is retried in a loop; the orchestrator leaves the run
    /// resumable and the next invocation picks it up.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Upstream { status, .. } => {
                matches!(*status, 408 | 409 | 425 | 429 | 500..=599)
            }
            SyncError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            SyncError::Auth(_) | SyncError::NumberingConflict { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::UnknownTenant(_)
        )
    }

    /// HTTP status of an upstream failure.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Upstream { status, .. } => Some(*status),
            SyncError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True for an upstream 404, which endpoint probing treats as "not here".
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::upstream(503, "unavailable").is_retryable());
        assert!(SyncError::upstream(429, "slow down").is_retryable());
        assert!(SyncError::Auth("expired".into()).is_retryable());

        assert!(!SyncError::upstream(400, "bad filter").is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidUrl("nope".into()).is_config_error());
        assert!(SyncError::UnknownTenant("t9".into()).is_config_error());
        assert!(!SyncError::upstream(500, "").is_config_error());
    }

    #[test]
    fn test_upstream_body_truncated_in_display_only() {
        let body = "x".repeat(2000);
        let err = SyncError::upstream(500, body.clone());

        let shown = err.to_string();
        assert!(shown.starts_with("Upstream returned 500: "));
        assert!(shown.ends_with("..."));
        assert!(shown.len() < 600);

        match err {
            SyncError::Upstream { body: kept, .. } => assert_eq!(kept.len(), 2000),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_code() {
        assert_eq!(SyncError::upstream(404, "").status_code(), Some(404));
        assert!(SyncError::upstream(404, "").is_not_found());
        assert_eq!(SyncError::InvalidRequest("x".into()).status_code(), None);
    }
}
