use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from a single completion request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// Connection, DNS or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The cancellation token fired. `partial` holds the text aggregated so far.
    #[error("request aborted")]
    Aborted { partial: String },

    /// The response body could not be interpreted at all.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CompletionError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CompletionError::Aborted { .. })
    }

    /// Classify into the short category shown to users.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CompletionError::Network(_) => ErrorCategory::Network,
            CompletionError::Http { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                408 => ErrorCategory::Network,
                429 | 500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Unknown,
            },
            CompletionError::Aborted { .. }
            | CompletionError::Decode(_)
            | CompletionError::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// User-facing text committed as the content of an error message.
    pub fn user_message(&self) -> String {
        let category = self.category();
        match self {
            CompletionError::Http { status, .. } => {
                format!("{} (HTTP {status})", category.user_message())
            }
            _ => category.user_message().to_string(),
        }
    }
}

/// Coarse, human-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Authentication,
    Server,
    Unknown,
}

impl ErrorCategory {
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Network => {
                "Network error: the model endpoint could not be reached. Check your connection and retry."
            }
            ErrorCategory::Authentication => {
                "Authentication failed: the API token was rejected."
            }
            ErrorCategory::Server => "The model service returned an error. Try again later.",
            ErrorCategory::Unknown => "Something went wrong while generating a response.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Server => write!(f, "server"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

/// Bookkeeping errors from the session store and turn controller.
///
/// Remote failures never surface here; they are committed into history
/// as error-status messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("session not found")]
    SessionNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("a turn is already in flight for this session")]
    TurnInFlight,

    #[error("no user message to retry from")]
    NothingToRetry,

    #[error("compare mode needs at least one model")]
    NoCompareModels,

    #[error("invalid edit: {0}")]
    InvalidEdit(String),
}

/// Configuration problems that cannot fall back to defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key not found in environment variable '{0}'")]
    MissingApiKey(String),

    #[error("invalid endpoint URL '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        let cases = [
            (401, ErrorCategory::Authentication),
            (403, ErrorCategory::Authentication),
            (408, ErrorCategory::Network),
            (429, ErrorCategory::Server),
            (500, ErrorCategory::Server),
            (503, ErrorCategory::Server),
            (400, ErrorCategory::Unknown),
            (404, ErrorCategory::Unknown),
        ];
        for (status, expected) in cases {
            let err = CompletionError::Http {
                status,
                body: String::new(),
            };
            assert_eq!(err.category(), expected, "status {status}");
        }
    }

    #[test]
    fn test_network_error_category() {
        let err = CompletionError::Network("connection refused".to_string());
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.user_message().starts_with("Network error"));
    }

    #[test]
    fn test_http_user_message_includes_status() {
        let err = CompletionError::Http {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(err.user_message().contains("HTTP 500"));
        assert!(!err.user_message().contains("boom"));
    }

    #[test]
    fn test_is_aborted() {
        assert!(CompletionError::Aborted {
            partial: "Hi".to_string()
        }
        .is_aborted());
        assert!(!CompletionError::Unknown("x".to_string()).is_aborted());
    }

    #[test]
    fn test_chat_error_display() {
        assert_eq!(
            ChatError::TurnInFlight.to_string(),
            "a turn is already in flight for this session"
        );
    }
}
