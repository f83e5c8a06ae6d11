//! Text wire protocol spoken over the signaling WebSocket
//!
//! The protocol is line-oriented plain text. A client registers with
//! `HELLO <id>`, requests a session with `SESSION <id>`, and once
//! paired every further text message is forwarded verbatim to the
//! partner. The relay never parses payload content.

use std::fmt;

use crate::error::ProtocolViolation;

/// Check that an identity token is usable: non-empty, no whitespace.
pub fn is_valid_identity(id: &str) -> bool {
    !id.is_empty() && !id.chars().any(char::is_whitespace)
}

/// Parse the mandatory first client message, `HELLO <id>`.
///
/// Validation order matters: a bad keyword is reported before a bad
/// identity, so the close reason tells the client which rule it broke.
pub fn parse_hello(msg: &str) -> Result<&str, ProtocolViolation> {
    let mut parts = msg.splitn(2, char::is_whitespace);

    if parts.next() != Some("HELLO") {
        return Err(ProtocolViolation::InvalidHello);
    }

    let id = parts.next().unwrap_or("");
    if !is_valid_identity(id) {
        return Err(ProtocolViolation::InvalidIdentity);
    }

    Ok(id)
}

/// Commands an unpaired peer may send after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// `SESSION <target>` - request pairing with another peer
    Session(&'a str),
    /// Anything else; logged and ignored, not a protocol error
    Unknown,
}

/// Classify a message from an unpaired peer.
pub fn parse_command(msg: &str) -> Command<'_> {
    match msg.split_once(' ') {
        Some(("SESSION", target)) if !target.is_empty() => Command::Session(target),
        _ => Command::Unknown,
    }
}

/// Server replies sent back to the requesting peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Handshake accepted
    Hello,
    /// Pairing accepted, the sender may now relay
    SessionOk,
    /// `SESSION` target was never registered
    PeerNotFound(String),
    /// `SESSION` target is already in a session
    PeerBusy(String),
    /// The sender itself is already in a session
    AlreadyInSession,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Hello => write!(f, "HELLO"),
            Reply::SessionOk => write!(f, "SESSION_OK"),
            Reply::PeerNotFound(id) => write!(f, "ERROR peer {} not found", id),
            Reply::PeerBusy(id) => write!(f, "ERROR peer {} busy", id),
            Reply::AlreadyInSession => write!(
                f,
                "ERROR you are already in a session, reconnect to the server to start a new session"
            ),
        }
    }
}
