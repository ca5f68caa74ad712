//! Shared error type for sources: configuration, transport, cancellation, and extraction failures.

use thiserror::Error;

/// Coarse classification of a [SourceError], for callers that only care about the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required selector/template is missing or invalid. Never retried.
    Configuration,
    /// Unretryable client-side failure, or a transient one that exhausted its retries.
    Network,
    /// The per-request deadline was exceeded on the final attempt.
    Timeout,
    /// The final attempt returned a non-success status.
    Http,
    /// The caller's cancellation token fired.
    Cancelled,
    /// A required structural element could not be located in a fetched page.
    Extraction,
}

/// Error returned by [Source](crate::Source) operations and the transport beneath them.
#[derive(Debug, Error)]
pub enum SourceError {
    // Configuration
    #[error("Site configuration is missing `{field}`")]
    MissingConfig { field: &'static str },

    #[error("Invalid site configuration `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Failed to build HTTP client: {source}")]
    ClientBuild { source: reqwest::Error },

    #[error("No source configured for host '{host}'. Use --source ID to pick one.")]
    UnrecognizedHost { host: String },

    #[error("No source with id '{id}'.")]
    UnknownSource { id: String },

    // Transport
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Network error: could not reach {url}: {source}")]
    Network { url: String, source: reqwest::Error },

    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Extraction
    #[error("Extraction failed: {message}")]
    Extraction { message: String },
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::MissingConfig { .. }
            | SourceError::InvalidConfig { .. }
            | SourceError::ClientBuild { .. }
            | SourceError::UnrecognizedHost { .. }
            | SourceError::UnknownSource { .. } => ErrorKind::Configuration,
            SourceError::InvalidUrl { .. } | SourceError::Network { .. } => ErrorKind::Network,
            SourceError::Timeout { .. } => ErrorKind::Timeout,
            SourceError::HttpStatus { .. } => ErrorKind::Http,
            SourceError::Cancelled => ErrorKind::Cancelled,
            SourceError::Extraction { .. } => ErrorKind::Extraction,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub(crate) fn extraction(message: impl Into<String>) -> Self {
        SourceError::Extraction {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        assert_eq!(
            SourceError::MissingConfig {
                field: "search.item_selector"
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(SourceError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(SourceError::Cancelled.is_cancelled());
        assert_eq!(
            SourceError::HttpStatus {
                status: 404,
                url: "https://example.com/".to_string()
            }
            .kind(),
            ErrorKind::Http
        );
        assert_eq!(
            SourceError::extraction("toc id not found").kind(),
            ErrorKind::Extraction
        );
        assert!(!SourceError::Timeout {
            url: "https://example.com/".to_string()
        }
        .is_cancelled());
    }

    #[test]
    fn messages_name_the_field() {
        let e = SourceError::MissingConfig {
            field: "chapters.list_selector",
        };
        assert_eq!(
            e.to_string(),
            "Site configuration is missing `chapters.list_selector`"
        );
    }
}
