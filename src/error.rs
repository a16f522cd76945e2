use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::codec::CodecError;
use crate::ncp::connection_packets::ConnectionErrorType;

/// Failures that are reported to callers of the transport API.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer sent a malformed frame or packet. This is always fatal to the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("send error: {0}")]
    Send(#[source] std::io::Error),

    /// All slots of the send window are waiting for acknowledgement. This is transient, callers
    ///  may retry after the peer caught up.
    #[error("send window is full ({0} unacknowledged packets)")]
    SendWindowFull(usize),

    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        size: usize,
        max: usize,
    },

    /// The connection handshake exhausted its retry budget
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    #[error("connection rejected by peer: {0:?}")]
    ConnectionRejected(ConnectionErrorType),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    pub fn protocol_violation(e: impl Display) -> TransportError {
        TransportError::ProtocolViolation(e.to_string())
    }
}

/// The reason why a connection terminated. Every connection reports exactly one of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DisconnectReason {
    /// [crate::connection::Connection::disconnect] was called locally
    LocalRequest,
    /// The peer closed its side of the connection
    RemoteRequest,
    /// Sending failed, and the socket is no longer usable
    SendError,
    /// The peer sent data that does not conform to the protocol
    ProtocolViolation,
    /// Reading from the socket failed
    ReceiveError,
    /// The peer stopped acknowledging packets or went silent
    Timeout,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::LocalRequest => "local request",
            DisconnectReason::RemoteRequest => "remote request",
            DisconnectReason::SendError => "send error",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::ReceiveError => "receive error",
            DisconnectReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// The non-error result of a send operation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    Sent,
    /// The connection is disconnected, and the payload was discarded
    NotConnected,
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::violation(TransportError::protocol_violation("negative frame length -1"), "protocol violation: negative frame length -1")]
    #[case::too_large(TransportError::MessageTooLarge { size: 10, max: 5 }, "message too large: 10 bytes (max 5 bytes)")]
    #[case::rejected(TransportError::ConnectionRejected(ConnectionErrorType::ServerFull), "connection rejected by peer: ServerFull")]
    #[case::window(TransportError::SendWindowFull(64), "send window is full (64 unacknowledged packets)")]
    fn test_display(#[case] error: TransportError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }
}
