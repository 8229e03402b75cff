//! The seam between the connection manager and the socket layer.

use crate::{Message, NetworkError, NetworkResult, PeerId};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::debug;

/// Operations the manager needs from the socket layer.
///
/// Calls never block; outcomes come back as `on_connected`,
/// `on_handshake_complete`, `on_disconnected` and `on_message` events.
pub trait PeerTransport: Send + Sync {
    /// Start dialing `addr`.
    fn connect(&self, addr: SocketAddr);

    /// Drop the connection to `peer`.
    fn disconnect(&self, peer: PeerId);

    /// Queue a message for `peer`.
    fn send(&self, peer: PeerId, message: Message) -> NetworkResult<()>;
}

/// Commands forwarded to the socket layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Dial a peer.
    Connect { addr: SocketAddr },
    /// Disconnect a peer.
    Disconnect { peer: PeerId },
    /// Send a message to a peer.
    SendMessage { peer: PeerId, message: Message },
}

/// [`PeerTransport`] that forwards commands over a channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the socket layer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Self { command_tx }, command_rx)
    }
}

impl PeerTransport for ChannelTransport {
    fn connect(&self, addr: SocketAddr) {
        if self.command_tx.send(NetworkCommand::Connect { addr }).is_err() {
            debug!(addr = %addr, "Transport closed, dropping connect");
        }
    }

    fn disconnect(&self, peer: PeerId) {
        if self
            .command_tx
            .send(NetworkCommand::Disconnect { peer })
            .is_err()
        {
            debug!(peer = %peer, "Transport closed, dropping disconnect");
        }
    }

    fn send(&self, peer: PeerId, message: Message) -> NetworkResult<()> {
        self.command_tx
            .send(NetworkCommand::SendMessage { peer, message })
            .map_err(|_| NetworkError::SendFailed {
                peer,
                reason: "transport channel closed".to_string(),
            })
    }
}
