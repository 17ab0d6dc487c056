//! Error types surfaced to request callers.

use thiserror::Error;

/// Prefix the server puts in front of unexpected exceptions.
const SERVER_ERROR_PREFIX: &str = "Error processing request. ";

/// Why a submitted request did not produce a successful response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The caller cancelled the request. Never a fault; do not log as one.
    #[error("request cancelled")]
    Cancelled,
    /// The server answered with `success: false`.
    #[error("server request '{command}' failed: {message}")]
    Server {
        command: String,
        message: String,
        /// Stack-like remainder of the server message, when it had one.
        stack: Option<String>,
    },
    /// The server process exited or its pipes broke.
    #[error("language service died: {reason}")]
    ServiceDied { reason: String },
    /// The client loop is gone, or the server was stopped for good after
    /// repeated crashes.
    #[error("language service client is not running")]
    NotRunning,
}

impl RequestError {
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn service_died(reason: impl Into<String>) -> Self {
        Self::ServiceDied {
            reason: reason.into(),
        }
    }

    /// Build a `Server` error from a failed response, splitting the server's
    /// exception format into message and stack.
    pub(crate) fn from_server(command: &str, raw_message: Option<&str>) -> Self {
        let raw = raw_message.unwrap_or("unknown error");
        let (message, stack) = split_server_error(raw);
        Self::Server {
            command: command.to_string(),
            message,
            stack,
        }
    }
}

/// Split `"Error processing request. <message>\n<stack>"` into its parts.
///
/// Best effort: anything that does not match the prefix is returned as the
/// message with no stack.
#[must_use]
pub fn split_server_error(raw: &str) -> (String, Option<String>) {
    let Some(rest) = raw.strip_prefix(SERVER_ERROR_PREFIX) else {
        return (raw.trim().to_string(), None);
    };
    match rest.split_once('\n') {
        Some((message, stack)) => {
            let stack = stack.trim();
            let stack = (!stack.is_empty()).then(|| stack.to_string());
            (message.trim().to_string(), stack)
        }
        None => (rest.trim().to_string(), None),
    }
}

/// An incoming message that does not fit the protocol. Indicates a bug on one
/// side of the pipe, not a recoverable runtime condition.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("message has no type field")]
    MissingType,
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A document resource the server cannot address.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot map resource to a server path: {resource}")]
pub struct PathError {
    pub resource: String,
}

/// A document the engine cannot synchronize.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("language {0:?} is not handled by the server")]
    UnsupportedLanguage(String),
    #[error("language service client is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_server_error_with_stack() {
        let raw = "Error processing request. Cannot read property 'x' of undefined\nTypeError: Cannot read\n    at foo (tsserver.js:1:2)";
        let (message, stack) = split_server_error(raw);
        assert_eq!(message, "Cannot read property 'x' of undefined");
        assert_eq!(
            stack.as_deref(),
            Some("TypeError: Cannot read\n    at foo (tsserver.js:1:2)")
        );
    }

    #[test]
    fn test_split_server_error_without_stack() {
        let (message, stack) = split_server_error("Error processing request. No project.");
        assert_eq!(message, "No project.");
        assert!(stack.is_none());
    }

    #[test]
    fn test_split_server_error_unknown_format() {
        let (message, stack) = split_server_error("No content available.");
        assert_eq!(message, "No content available.");
        assert!(stack.is_none());
    }

    #[test]
    fn test_from_server_defaults_missing_message() {
        let err = RequestError::from_server("quickinfo", None);
        assert_eq!(
            err,
            RequestError::Server {
                command: "quickinfo".to_string(),
                message: "unknown error".to_string(),
                stack: None,
            }
        );
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_cancellation_kind() {
        assert!(RequestError::Cancelled.is_cancellation());
        assert!(!RequestError::service_died("exit").is_cancellation());
    }
}
