//! Error types and handling for the moldcast library

use thiserror::Error;

/// Result type alias for moldcast operations
pub type Result<T> = std::result::Result<T, MoldError>;

/// Main error type for the moldcast library
#[derive(Error, Debug)]
pub enum MoldError {
    /// I/O errors from network operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on an endpoint that is not open
    #[error("Endpoint is closed")]
    Closed,

    /// Open called on an endpoint that already is
    #[error("Endpoint is already open")]
    AlreadyOpen,

    /// Group send on a receive endpoint or vice versa
    #[error("Endpoint is open in the wrong mode for this operation")]
    WrongMode,

    /// Batched or ring operations on an endpoint that does not advertise them
    #[error("Endpoint does not support this capability")]
    CapabilityUnsupported,

    /// Packet shorter than the fixed header, or a session tag that does
    /// not fit it
    #[error("Malformed header: {reason}")]
    MalformedHeader {
        /// What about the header failed to parse or encode
        reason: &'static str,
    },

    /// Packet tagged with a session other than the one this stream bound to
    #[error("Session mismatch: bound {bound:?}, packet {got:?}")]
    SessionMismatch {
        /// Session tag the subscriber is bound to
        bound: String,
        /// Session tag carried by the offending packet
        got: String,
    },

    /// `message_count` outside the valid data range and not a sentinel
    #[error("Invalid message count {0}")]
    InvalidMessageCount(u16),

    /// Payload ended before the announced message bytes
    #[error("Truncated payload: {reason}")]
    TruncatedPayload {
        /// Which part of the payload was cut short
        reason: &'static str,
    },

    /// Message too large to ever fit a datagram; rejected at feed time
    #[error("Message of {size} bytes exceeds the wire capacity")]
    OversizedMessage {
        /// Size of the rejected message
        size: usize,
    },

    /// Interface has no usable IPv4 address for multicast
    #[error("No interface address: {0}")]
    NoInterfaceAddress(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl MoldError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new malformed-header error
    pub fn malformed(reason: &'static str) -> Self {
        Self::MalformedHeader { reason }
    }

    /// Create a new truncated-payload error
    pub fn truncated(reason: &'static str) -> Self {
        Self::TruncatedPayload { reason }
    }

    /// True for per-packet faults a receive loop counts and skips
    /// rather than propagating
    pub fn is_packet_fault(&self) -> bool {
        matches!(
            self,
            Self::MalformedHeader { .. }
                | Self::SessionMismatch { .. }
                | Self::InvalidMessageCount(_)
                | Self::TruncatedPayload { .. }
        )
    }

    /// True when the error came from the transport rather than the protocol
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Closed | Self::AlreadyOpen | Self::WrongMode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MoldError::config("bad ppms");
        assert!(matches!(err, MoldError::InvalidConfig { .. }));
        assert!(!err.is_packet_fault());
    }

    #[test]
    fn test_error_classification() {
        let header = MoldError::malformed("short packet");
        assert!(header.is_packet_fault());
        assert!(!header.is_transport_error());

        let closed = MoldError::Closed;
        assert!(closed.is_transport_error());
        assert!(!closed.is_packet_fault());

        let io = MoldError::from(std::io::Error::other("boom"));
        assert!(io.is_transport_error());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = MoldError::SessionMismatch {
            bound: "20180101".into(),
            got: "20180102".into(),
        };
        let text = err.to_string();
        assert!(text.contains("20180101"));
        assert!(text.contains("20180102"));
    }
}
