//! Per-connection plumbing: serialized writes and keepalive receive
//!
//! Every write to a connection (replies, relayed payloads, pings, the
//! cleanup coordinator's force-close) is queued onto the connection's
//! writer task through an unbounded channel, so two tasks can never
//! race writes onto one socket.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::registry::Outbox;

/// Items queued for a connection's writer task
#[derive(Debug)]
pub enum Outbound {
    /// A text frame: reply or relayed payload
    Text(String),
    /// Keepalive probe issued by the liveness monitor
    Ping,
    /// Answer to a client-initiated ping
    Pong(Vec<u8>),
    /// Close the connection; the writer exits afterwards
    Close(Option<CloseFrame<'static>>),
}

/// Build the close item for a protocol violation (close code 1002).
pub fn protocol_close(reason: &'static str) -> Outbound {
    Outbound::Close(Some(CloseFrame {
        code: CloseCode::Protocol,
        reason: reason.into(),
    }))
}

/// Build the close item sent to every peer when the server drains on
/// shutdown (close code 1001, going away).
pub fn shutdown_close() -> Outbound {
    Outbound::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "server shutting down".into(),
    }))
}

/// Drain the outbox onto the socket until a close is sent, the channel
/// is dropped by all senders, or the transport fails.
pub async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbox: UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbox.recv().await {
        let msg = match item {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Pong(data) => Message::Pong(data),
            Outbound::Close(frame) => {
                let _ = sink.send(Message::Close(frame)).await;
                break;
            }
        };

        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

/// Receive the next text message, pinging whenever the connection has
/// been idle for `timeout`.
///
/// The ping never counts as the received message and nothing is
/// dropped or reordered; idle periods are simply filled with probes so
/// half-open connections surface as transport errors. Returns `None`
/// once the connection is closed or errored.
pub async fn recv_with_keepalive(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    outbox: &Outbox,
    timeout: Duration,
    peer: &str,
) -> Option<String> {
    loop {
        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => {
                debug!("Sending keepalive ping to {}", peer);
                if outbox.send(Outbound::Ping).is_err() {
                    // Writer already gone, the connection is dead
                    return None;
                }
            }
            Ok(None) => return None,
            Ok(Some(Ok(Message::Text(text)))) => return Some(text),
            Ok(Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = outbox.send(Outbound::Pong(data));
            }
            // Pongs to our probes, binary frames: not protocol traffic
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error from {}: {:?}", peer, e);
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_close_frame() {
        match protocol_close("invalid protocol") {
            Outbound::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Protocol);
                assert_eq!(frame.reason, "invalid protocol");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
