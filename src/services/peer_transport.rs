// Quick Tabs Peer Transports
// The coordinator talks to peers through two channels: acknowledged direct sends
// (PeerTransport) and a best-effort same-origin bus (LocalBus). ChannelTransport and
// LocalBroadcastBus are the in-process implementations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::types::errors::TransportError;
use crate::types::peer::{PeerId, PeerRecord};

/// Direct delivery to one peer, plus enumeration of the live peer set.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Resolves once the peer acknowledges. A missing listener is an error, not a panic.
    async fn send_to_peer(&self, peer_id: PeerId, message: Value) -> Result<(), TransportError>;
    async fn list_peers(&self) -> Result<Vec<PeerRecord>, TransportError>;
}

/// Same-origin fire-and-forget bus.
pub trait LocalBus: Send + Sync {
    /// Returns the number of receivers that saw the message.
    fn publish(&self, message: Value) -> usize;
    fn subscribe(&self) -> broadcast::Receiver<Value>;
}

/// A message handed to an in-process peer. Drop `ack` to leave the sender waiting.
#[derive(Debug)]
pub struct PeerDelivery {
    pub message: Value,
    pub ack: oneshot::Sender<()>,
}

/// In-process transport backed by one mpsc inbox per registered peer.
#[derive(Default)]
pub struct ChannelTransport {
    peers: Mutex<BTreeMap<PeerId, (PeerRecord, mpsc::UnboundedSender<PeerDelivery>)>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer and returns its inbox.
    pub fn register_peer(&self, peer: PeerRecord) -> mpsc::UnboundedReceiver<PeerDelivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer.peer_id, (peer, tx));
        }
        rx
    }

    pub fn unregister_peer(&self, peer_id: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&peer_id);
        }
    }
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn send_to_peer(&self, peer_id: PeerId, message: Value) -> Result<(), TransportError> {
        let (ack, ack_rx) = oneshot::channel();
        {
            let peers = self
                .peers
                .lock()
                .map_err(|_| TransportError::Enumeration("peer table poisoned".to_string()))?;
            let (_, inbox) = peers.get(&peer_id).ok_or(TransportError::NotListening(peer_id))?;
            inbox
                .send(PeerDelivery { message, ack })
                .map_err(|_| TransportError::NotListening(peer_id))?;
        }
        // The peer dropped the delivery without acknowledging it.
        ack_rx.await.map_err(|_| TransportError::NotListening(peer_id))
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, TransportError> {
        let peers = self
            .peers
            .lock()
            .map_err(|_| TransportError::Enumeration("peer table poisoned".to_string()))?;
        Ok(peers.values().map(|(record, _)| record.clone()).collect())
    }
}

/// Local bus over a tokio broadcast channel.
pub struct LocalBroadcastBus {
    tx: broadcast::Sender<Value>,
}

impl LocalBroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl LocalBus for LocalBroadcastBus {
    fn publish(&self, message: Value) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}
