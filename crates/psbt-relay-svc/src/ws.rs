//! WebSocket peer connections

use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use psbt_relay::{async_trait, PeerId, PeerTransport, RelayError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound frame queues of connected peers
#[derive(Default)]
pub struct WsTransport {
    peers: DashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl WsTransport {
    /// Register a connection, returning its id and outbound queue
    pub fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.peers.insert(id, tx);
        (id, rx)
    }

    pub fn remove(&self, peer: PeerId) {
        self.peers.remove(&peer);
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    async fn send(&self, peer: PeerId, frame: Vec<u8>) -> psbt_relay::Result<()> {
        let queue = self.peers.get(&peer).ok_or(RelayError::UnknownPeer(peer))?;
        queue
            .send(frame)
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }
}

/// Serve an inbound WebSocket peer until it disconnects
pub async fn serve_inbound(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (peer, mut outbound) = state.node.transport().register();
    info!(%peer, "Inbound peer connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Binary(frame)) => {
                let decision = state.node.receive(Some(peer), &frame).await;
                debug!(%peer, ?decision, "Frame handled");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(%peer, %error, "WebSocket error");
                break;
            }
        }
    }

    state.node.transport().remove(peer);
    writer.abort();
    info!(%peer, "Inbound peer disconnected");
}

/// Keep an outbound connection to `url` alive, reconnecting after failures
pub async fn maintain_outbound(url: String, state: Arc<AppState>, retry: Duration) {
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                let (mut sender, mut receiver) = stream.split();
                let (peer, mut outbound) = state.node.transport().register();
                info!(%peer, url = %url, "Connected to peer");

                let writer = tokio::spawn(async move {
                    while let Some(frame) = outbound.recv().await {
                        if sender.send(WsMessage::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(message) = receiver.next().await {
                    match message {
                        Ok(WsMessage::Binary(frame)) => {
                            let decision = state.node.receive(Some(peer), &frame).await;
                            debug!(%peer, ?decision, "Frame handled");
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(error) => {
                            warn!(%peer, %error, "WebSocket error");
                            break;
                        }
                    }
                }

                state.node.transport().remove(peer);
                writer.abort();
                warn!(%peer, url = %url, "Peer disconnected");
            }
            Err(error) => warn!(url = %url, %error, "Failed to connect to peer"),
        }
        tokio::time::sleep(retry).await;
    }
}
