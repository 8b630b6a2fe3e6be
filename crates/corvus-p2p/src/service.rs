//! Transport contract.

use crate::{IncomingMessage, MessageKind, P2pResult, PeerId, Priority};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Contract the p2p transport offers the synchronizer.
///
/// Sends are best-effort and non-blocking; the transport queues
/// internally. `register` yields a durable, unbounded subscription for
/// the given message kinds, so a slow receiver can never block a
/// transport thread.
pub trait PeerService: Send + Sync {
    /// Subscribe to the listed message kinds under `topic`.
    fn register(
        &self,
        topic: &str,
        kinds: &[MessageKind],
    ) -> P2pResult<mpsc::UnboundedReceiver<IncomingMessage>>;

    /// Best-effort multicast to all connected peers.
    fn broadcast(&self, data: Bytes, kind: MessageKind, priority: Priority) -> P2pResult<()>;

    /// Best-effort unicast to one peer.
    fn send_to_peer(
        &self,
        peer: &PeerId,
        data: Bytes,
        kind: MessageKind,
        priority: Priority,
    ) -> P2pResult<()>;
}
