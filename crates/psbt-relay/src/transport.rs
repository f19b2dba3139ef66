//! Peer transport abstraction and the relay node built on it

use crate::engine::{RelayDecision, RelayEngine};
use crate::error::{RelayError, Result};
use crate::message::SignetPsbtMessage;
use crate::PeerId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivers framed messages to connected peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one frame to `peer`
    async fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<()>;

    /// Currently connected peers
    fn peers(&self) -> Vec<PeerId>;
}

/// Frame received from a peer
pub type Inbound = (PeerId, Vec<u8>);

/// In-memory transport for local testing
pub struct MemoryTransport {
    id: PeerId,
    inbox: mpsc::UnboundedSender<Inbound>,
    links: DashMap<PeerId, mpsc::UnboundedSender<Inbound>>,
}

impl MemoryTransport {
    /// Create a transport and the receiver of its inbound frames
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                inbox,
                links: DashMap::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Connect two transports in both directions
    pub fn link(&self, other: &MemoryTransport) {
        self.links.insert(other.id, other.inbox.clone());
        other.links.insert(self.id, self.inbox.clone());
    }

    /// Drop the connection to `peer`
    pub fn unlink(&self, peer: PeerId) {
        self.links.remove(&peer);
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<()> {
        let link = self.links.get(&peer).ok_or(RelayError::UnknownPeer(peer))?;
        link.send((self.id, frame))
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.links.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }
}

/// A message accepted for local processing
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: SignetPsbtMessage,
    /// The local signer should add its signature
    pub sign: bool,
}

/// Relay engine bound to a transport
pub struct RelayNode<T> {
    engine: Arc<RelayEngine>,
    transport: Arc<T>,
    local: mpsc::UnboundedSender<Delivery>,
}

impl<T: PeerTransport> RelayNode<T> {
    /// Create a node and the receiver of messages accepted for local processing
    pub fn new(engine: Arc<RelayEngine>, transport: Arc<T>) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (local, rx) = mpsc::unbounded_channel();
        (
            Self {
                engine,
                transport,
                local,
            },
            rx,
        )
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Handle a frame received from `from` (`None` for local injection)
    pub async fn receive(&self, from: Option<PeerId>, frame: &[u8]) -> RelayDecision {
        let peers = self.transport.peers();
        let (decision, message) = self.engine.handle_frame(from, &peers, frame);

        if let (RelayDecision::Accept { forward_to, sign }, Some(message)) = (&decision, message) {
            self.forward(forward_to, frame).await;
            if self.local.send(Delivery { message, sign: *sign }).is_err() {
                debug!("Local processing channel closed");
            }
        }
        decision
    }

    /// Send a locally produced message to every peer
    pub async fn broadcast(&self, message: &SignetPsbtMessage) -> Result<usize> {
        let frame = self.engine.originate(message)?;
        let peers = self.transport.peers();
        Ok(self.forward(&peers, &frame).await)
    }

    async fn forward(&self, peers: &[PeerId], frame: &[u8]) -> usize {
        let mut sent = 0;
        for peer in peers {
            match self.transport.send(*peer, frame.to_vec()).await {
                Ok(()) => sent += 1,
                Err(error) => warn!(%error, %peer, "Failed to forward message"),
            }
        }
        sent
    }
}

impl<T> Clone for RelayNode<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            transport: self.transport.clone(),
            local: self.local.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DropReason, RelayPolicy};
    use bitcoin::p2p::Magic;

    fn message(nonce: u64) -> SignetPsbtMessage {
        SignetPsbtMessage {
            nonce,
            psbt: vec![nonce as u8],
            block_template: Vec::new(),
            signers_short_ids: Vec::new(),
        }
    }

    fn node() -> (
        RelayNode<MemoryTransport>,
        mpsc::UnboundedReceiver<Inbound>,
        mpsc::UnboundedReceiver<Delivery>,
    ) {
        let (transport, inbox) = MemoryTransport::new();
        let engine = RelayEngine::new(RelayPolicy::default(), Magic::from_bytes([1, 2, 3, 4]));
        let (node, local) = RelayNode::new(Arc::new(engine), Arc::new(transport));
        (node, inbox, local)
    }

    #[tokio::test]
    async fn test_forward_once_without_echo() {
        let (a, mut a_in, _) = node();
        let (b, mut b_in, mut b_local) = node();
        let (c, mut c_in, _) = node();
        b.transport().link(a.transport());
        b.transport().link(c.transport());

        assert_eq!(a.broadcast(&message(1)).await.unwrap(), 1);
        let (from, frame) = b_in.recv().await.unwrap();
        assert_eq!(from, a.transport().id());

        let decision = b.receive(Some(from), &frame).await;
        assert_eq!(
            decision,
            RelayDecision::Accept {
                forward_to: vec![c.transport().id()],
                sign: false
            }
        );
        assert_eq!(b_local.recv().await.unwrap().message, message(1));

        // c got exactly one copy, a got none back
        let (from, _) = c_in.recv().await.unwrap();
        assert_eq!(from, b.transport().id());
        assert!(c_in.try_recv().is_err());
        assert!(a_in.try_recv().is_err());

        // Second delivery of the same frame is neither processed nor forwarded
        assert_eq!(
            b.receive(Some(c.transport().id()), &frame).await,
            RelayDecision::Drop(DropReason::Duplicate)
        );
        assert!(a_in.try_recv().is_err());
        assert!(b_local.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_triangle_converges() {
        let nodes: Vec<_> = (0..3).map(|_| node()).collect();
        nodes[0].0.transport().link(nodes[1].0.transport());
        nodes[1].0.transport().link(nodes[2].0.transport());
        nodes[2].0.transport().link(nodes[0].0.transport());
        let (mut nodes, mut inboxes): (Vec<_>, Vec<_>) =
            nodes.into_iter().map(|(node, inbox, _)| (node, inbox)).unzip();

        nodes[0].broadcast(&message(9)).await.unwrap();

        let mut delivered = 0;
        loop {
            let mut idle = true;
            for (node, inbox) in nodes.iter_mut().zip(inboxes.iter_mut()) {
                while let Ok((from, frame)) = inbox.try_recv() {
                    idle = false;
                    if node.receive(Some(from), &frame).await.is_accepted() {
                        delivered += 1;
                    }
                }
            }
            if idle {
                break;
            }
        }
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (transport, _) = MemoryTransport::new();
        let peer = Uuid::new_v4();

        assert!(matches!(
            transport.send(peer, vec![1]).await,
            Err(RelayError::UnknownPeer(p)) if p == peer
        ));
    }
}
