//! Error types for the internal message bus.

use crate::converter::ConversionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error categories drive retry and dead-letter decisions.
///
/// - **Transient**: temporary failure, the operation may be retried
/// - **Permanent**: unrecoverable, route to the error channel immediately
/// - **RateLimited**: the downstream pushed back, retry with longer delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Broker unavailable, publish buffer full, ack timeout
    Transient,

    /// Malformed payload, missing stream, rejected configuration
    Permanent,

    RateLimited,
}

impl ErrorCategory {
    /// Whether errors of this category are worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    /// Maximum attempts for a caller that retries by category.
    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorCategory::Transient => 3,
            ErrorCategory::Permanent => 0,
            ErrorCategory::RateLimited => 5,
        }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries()
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// Error raised by channels and handlers on the internal bus.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Temporary failure (full buffer, downstream unavailable)
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Failure that will not go away on retry
    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Payload could not be converted
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Channel has no receiver or subscriber left
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Transient { .. } => ErrorCategory::Transient,
            ProcessingError::Permanent { .. } => ErrorCategory::Permanent,
            ProcessingError::RateLimited { .. } => ErrorCategory::RateLimited,
            ProcessingError::Conversion(_) => ErrorCategory::Permanent,
            ProcessingError::ChannelClosed(_) => ErrorCategory::Permanent,
            ProcessingError::Config(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
    }

    #[test]
    fn test_error_category_should_retry() {
        assert!(ErrorCategory::Transient.should_retry(2));
        assert!(!ErrorCategory::Transient.should_retry(3));
        assert!(!ErrorCategory::Permanent.should_retry(0));
        assert!(ErrorCategory::RateLimited.should_retry(4));
    }

    #[test]
    fn test_processing_error_category() {
        assert_eq!(
            ProcessingError::transient("buffer full").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ProcessingError::permanent("bad payload").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            ProcessingError::ChannelClosed("out".into()).category(),
            ErrorCategory::Permanent
        );

        let conversion: ProcessingError = ConversionError::Decode("eof".into()).into();
        assert!(!conversion.is_retryable());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::RateLimited.to_string(), "rate_limited");
    }
}
