//! WebSocket signaling relay server
//!
//! One tokio task per accepted connection. The task sequence is
//! handshake, receive loop, cleanup; cleanup runs exactly once however
//! the loop exits. A handshake failure closes the socket directly
//! since the peer was never registered.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use switchboard_core::{parse_command, parse_hello, Command, Config, Reply, SignalError};

use crate::conn::{self, protocol_close, Outbound};
use crate::registry::{Outbox, PairError, Registry, RelayTarget};

/// Signaling relay state
pub struct SignalServer {
    registry: Arc<Registry>,
    config: Config,
}

impl SignalServer {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    /// Bind and run the accept loop until an I/O error occurs.
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Run the accept loop on an already bound listener.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Signaling relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let registry = self.registry.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, registry, config).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Close every active connection and empty the registry. Called
    /// when the process is asked to stop.
    pub fn shutdown(&self) {
        let drained = self.registry.drain();
        if !drained.is_empty() {
            info!("Draining {} active connections", drained.len());
        }
        for (peer, outbox, addr) in drained {
            debug!("Closing {} at {}", peer, addr);
            let _ = outbox.send(conn::shutdown_close());
        }
    }

    /// Number of registered peers (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Shared registry handle
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Handle a single accepted TCP connection.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    config: Config,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Health probes are plain HTTP on the same port; answer them
    // without touching the registry
    if serve_health(&mut stream, &config.health_path).await? {
        return Ok(());
    }

    let ws_stream = accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    debug!("Connected to {}", peer_addr);

    // All writes to this connection funnel through the writer task
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(conn::write_loop(ws_sender, outbox_rx));

    let peer_id = match handshake(&mut ws_receiver, &outbox, peer_addr, &registry).await {
        Ok(id) => id,
        Err(SignalError::Protocol(violation)) => {
            warn!("Rejected handshake from {}: {}", peer_addr, violation);
            let _ = outbox.send(protocol_close(violation.close_reason()));
            drop(outbox);
            let _ = writer.await;
            return Ok(());
        }
        Err(e) => {
            debug!("Connection from {} ended before registration: {}", peer_addr, e);
            drop(outbox);
            let _ = writer.await;
            return Ok(());
        }
    };

    while let Some(msg) =
        conn::recv_with_keepalive(&mut ws_receiver, &outbox, config.keepalive_timeout(), &peer_id)
            .await
    {
        if let Err(e) = dispatch(&registry, &peer_id, msg, &outbox) {
            if let SignalError::PartnerVanished(partner) = &e {
                error!("Internal consistency fault for {}: {}", peer_id, e);
                cleanup_peer(&registry, partner);
            }
            break;
        }
    }

    // Exactly-once finalization for this connection; a second call for
    // the same identity is a no-op
    cleanup_peer(&registry, &peer_id);

    drop(outbox);
    let _ = writer.await;
    debug!("Connection handler for {} exited", peer_id);
    Ok(())
}

/// Read and validate the initial `HELLO <id>` message, register the
/// peer, and confirm with `HELLO`.
async fn handshake(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    outbox: &Outbox,
    peer_addr: SocketAddr,
    registry: &Registry,
) -> Result<String, SignalError> {
    loop {
        let msg = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                let _ = outbox.send(Outbound::Pong(data));
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(SignalError::Transport("closed before hello".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SignalError::Transport(e.to_string())),
        };

        let id = parse_hello(&msg)?;
        registry.register(id, peer_addr, outbox.clone())?;

        let _ = outbox.send(Outbound::Text(Reply::Hello.to_string()));
        info!("Registered peer {} at {}", id, peer_addr);
        return Ok(id.to_string());
    }
}

/// Route one inbound message: relay it if the peer is paired,
/// otherwise treat it as a pairing command.
fn dispatch(
    registry: &Registry,
    peer_id: &str,
    msg: String,
    outbox: &Outbox,
) -> Result<(), SignalError> {
    match registry.relay_target(peer_id) {
        // In a session: every message is opaque payload for the partner
        RelayTarget::Partner {
            id: partner,
            outbox: partner_outbox,
        } => {
            debug!("{} -> {}: {}", peer_id, partner, msg);
            if partner_outbox.send(Outbound::Text(msg)).is_err() {
                // Partner's writer already exited; its cleanup is about
                // to force-close this connection as well
                debug!("Dropping relay from {}: {} is closing", peer_id, partner);
            }
            Ok(())
        }

        RelayTarget::Vanished { partner } => Err(SignalError::PartnerVanished(partner)),

        RelayTarget::NotPaired => {
            match parse_command(&msg) {
                Command::Session(target) => {
                    let reply = match registry.pair(peer_id, target) {
                        Ok(()) => {
                            // SESSION_OK was queued inside the pairing
                            // critical section
                            info!("Session from {} to {}", peer_id, target);
                            None
                        }
                        Err(PairError::NotFound) => Some(Reply::PeerNotFound(target.to_string())),
                        Err(PairError::Busy) => Some(Reply::PeerBusy(target.to_string())),
                        Err(PairError::AlreadyInSession) => Some(Reply::AlreadyInSession),
                        // Concurrently removed; the close is already queued
                        Err(PairError::CallerGone) => None,
                    };

                    if let Some(reply) = reply {
                        debug!("Rejecting SESSION from {}: {}", peer_id, reply);
                        let _ = outbox.send(Outbound::Text(reply.to_string()));
                    }
                    Ok(())
                }
                Command::Unknown => {
                    debug!("Ignoring unknown message {:?} from {}", msg, peer_id);
                    Ok(())
                }
            }
        }
    }
}

/// Cleanup coordinator: unwind the departing peer's registry entry and
/// session, force-closing a still-connected partner. Idempotent.
pub(crate) fn cleanup_peer(registry: &Registry, id: &str) {
    let removal = registry.remove(id);
    if !removal.removed {
        return;
    }

    let mut closed = removal.closed.into_iter();

    if let Some((peer, outbox, addr)) = closed.next() {
        let _ = outbox.send(Outbound::Close(None));
        info!("Disconnected peer {} at {}", peer, addr);
    }

    // The partner's client must observe the session ending rather than
    // be left half-paired, so its connection is closed too
    for (partner, outbox, addr) in closed {
        info!("Closing connection to session partner {} at {}", partner, addr);
        let _ = outbox.send(Outbound::Close(None));
    }
}

/// Answer a plain HTTP health probe on the configured path. Returns
/// `true` when the request was consumed and the connection should be
/// dropped; any other traffic is left untouched for the WebSocket
/// handshake.
async fn serve_health(
    stream: &mut TcpStream,
    health_path: &str,
) -> Result<bool, std::io::Error> {
    let mut peek_buf = [0u8; 1024];
    let n = stream.peek(&mut peek_buf).await?;
    let head = String::from_utf8_lossy(&peek_buf[..n]);

    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1));

    if path != Some(health_path) {
        return Ok(false);
    }

    // Consume the probe before responding
    let mut drain = vec![0u8; n];
    stream.read_exact(&mut drain).await?;

    let body = "OK\n";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(true)
}
