use thiserror::Error;

use crate::fetch::FetchResponse;

/// An `Error` envelope received from the peer, kept together with the
/// response-shaped view of it handed to callers.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// HTTP status carried by the error envelope.
    pub status: u16,
    /// Human-readable message from the peer.
    pub message: String,
    /// Optional stack trace or diagnostic detail from the peer.
    pub stack: Option<String>,
    /// Response-shaped body: `{"error": message, "stack": ...}`.
    pub response: FetchResponse,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request {id} timed out after {timeout_ms}ms")]
    RequestTimeout { id: String, timeout_ms: u64 },

    #[error("request {id} expired after {age_ms}ms without an answer")]
    RequestExpired { id: String, age_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("disposed")]
    Disposed,

    #[error("handler error: {message}")]
    HandlerError { message: String },

    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("remote error {}: {}", .0.status, .0.message)]
    Remote(Box<RemoteError>),

    #[error("message too large: {size} bytes (max {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("channel closed")]
    ChannelClosed,

    #[error("server closed")]
    ServerClosed,

    #[error("duplicate request id {id}")]
    DuplicateRequestId { id: String },

    #[error("status {0} is not an allowed HTTP status")]
    InvalidStatus(u16),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// HTTP status a caller sees for this condition.
    pub fn status(&self) -> u16 {
        match self {
            TransportError::RequestTimeout { .. } | TransportError::RequestExpired { .. } => 408,
            TransportError::ConnectionClosed
            | TransportError::Disposed
            | TransportError::ChannelClosed
            | TransportError::ServerClosed => 503,
            TransportError::Remote(remote) => remote.status,
            TransportError::MessageTooLarge { .. } => 413,
            TransportError::MalformedMessage { .. } => 400,
            _ => 500,
        }
    }

    /// True for per-request timeouts and sweep expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::RequestTimeout { .. } | TransportError::RequestExpired { .. }
        )
    }

    /// True when the local side or the channel was torn down.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed
                | TransportError::Disposed
                | TransportError::ChannelClosed
                | TransportError::ServerClosed
        )
    }

    /// The remote error details, if this error came back from the peer.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            TransportError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let timeout = TransportError::RequestTimeout {
            id: "a".to_string(),
            timeout_ms: 10,
        };
        assert_eq!(timeout.status(), 408);
        assert!(timeout.is_timeout());

        assert_eq!(TransportError::Disposed.status(), 503);
        assert_eq!(TransportError::ConnectionClosed.status(), 503);
        assert!(TransportError::ConnectionClosed.is_closed());

        let handler = TransportError::HandlerError {
            message: "boom".to_string(),
        };
        assert_eq!(handler.status(), 500);
        assert!(!handler.is_timeout());
        assert!(!handler.is_closed());

        let big = TransportError::MessageTooLarge {
            size: 10,
            max_size: 5,
        };
        assert_eq!(big.status(), 413);
    }

    #[test]
    fn test_display_messages() {
        let err = TransportError::RequestExpired {
            id: "req-1".to_string(),
            age_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "request req-1 expired after 1500ms without an answer"
        );
        assert_eq!(
            TransportError::InvalidStatus(299).to_string(),
            "status 299 is not an allowed HTTP status"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TransportError = parse.into();
        assert!(matches!(err, TransportError::SerializationError(_)));
    }
}
