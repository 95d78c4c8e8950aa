use crate::identity::PeerId;
use crate::protocol::{Message, SyncChange};
use discovery::DiscoveryMethod;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the stream or it errored
    Closed,
    /// Local `disconnect` call
    Local,
    /// Dropped after missing heartbeats
    Dead,
    Shutdown,
}

/// Everything the node reports to collaborators.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDiscovered {
        peer_id: PeerId,
        address: SocketAddr,
        method: DiscoveryMethod,
    },
    PeerConnected {
        peer_id: PeerId,
        direction: Direction,
    },
    PeerDisconnected {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
    /// No heartbeat within the timeout
    PeerDead { peer_id: PeerId },
    PeerAlive { peer_id: PeerId },
    /// Application message not consumed by the core (chat, presence, typing)
    MessageReceived { peer_id: PeerId, message: Message },
    /// Frame dropped by the encrypted layer
    MessageRejected { peer_id: PeerId, reason: String },
    TransferOffered {
        peer_id: PeerId,
        transfer_id: String,
        name: String,
        size: u64,
    },
    TransferProgress {
        transfer_id: String,
        done: u64,
        total: u64,
    },
    TransferComplete {
        transfer_id: String,
        /// Where a received file was saved; `None` on the sending side
        path: Option<PathBuf>,
    },
    TransferFailed { transfer_id: String, reason: String },
    TeamDataApplied {
        team_id: String,
        change: SyncChange,
        from: PeerId,
    },
    TeamInvitation {
        team_id: String,
        team_name: String,
        inviter: PeerId,
        members: Vec<PeerId>,
    },
    ReconnectFailed { peer_id: PeerId, attempts: u32 },
    QueueEntryFailed {
        entry_id: String,
        peer_id: PeerId,
        retries: u32,
    },
}

/// Fan-out of [`NodeEvent`]s to any number of subscribers.
///
/// Publishing never blocks; a lagging subscriber loses the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
