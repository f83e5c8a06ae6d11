//! Switchboard Signaling Relay
//!
//! Lets exactly two peers discover each other by a self-chosen
//! identity and exchange opaque session-negotiation messages over
//! WebSocket. The relay never inspects relayed payloads.
//!
//! # Protocol
//!
//! 1. Client registers with `HELLO <id>`, server confirms with `HELLO`
//! 2. Client requests a session with `SESSION <id>`
//! 3. Server answers `SESSION_OK` (or an `ERROR ...` line)
//! 4. Every further text message is forwarded verbatim to the partner
//! 5. When either side disconnects, the other is closed as well

pub mod conn;
pub mod registry;
pub mod server;

pub use registry::{PairingState, Registry};
pub use server::SignalServer;
