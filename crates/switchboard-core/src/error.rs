//! Error types for the Switchboard relay

use thiserror::Error;

/// Handshake rejections that close the offending connection
///
/// These never affect any other connection; the close reason is the
/// one the client sees in the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// First message was not `HELLO <id>`
    #[error("invalid hello")]
    InvalidHello,

    /// Identity was empty or contained whitespace
    #[error("invalid peer uid")]
    InvalidIdentity,

    /// Identity is already registered
    #[error("peer uid already registered")]
    DuplicateIdentity,
}

impl ProtocolViolation {
    /// Reason string carried in the close frame (wire-compatible with
    /// the reference signaling servers).
    pub fn close_reason(&self) -> &'static str {
        match self {
            ProtocolViolation::InvalidHello => "invalid protocol",
            ProtocolViolation::InvalidIdentity | ProtocolViolation::DuplicateIdentity => {
                "invalid peer uid"
            }
        }
    }
}

/// Per-connection failures surfaced by the supervisor loop
#[derive(Debug, Error)]
pub enum SignalError {
    /// The client broke the handshake protocol
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The underlying connection dropped or a send failed
    #[error("transport failure: {0}")]
    Transport(String),

    /// A relay partner vanished while the session claimed it existed
    #[error("consistency fault: partner {0} missing from registry")]
    PartnerVanished(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reasons() {
        assert_eq!(
            ProtocolViolation::InvalidHello.close_reason(),
            "invalid protocol"
        );
        assert_eq!(
            ProtocolViolation::InvalidIdentity.close_reason(),
            "invalid peer uid"
        );
        assert_eq!(
            ProtocolViolation::DuplicateIdentity.close_reason(),
            "invalid peer uid"
        );
    }
}
