//! The node: one running installation.
//!
//! `Node::start` binds the listener, loads durable state and spawns the
//! background workers (discovery, sightings, dispatch, heartbeat, liveness
//! sweep, reconnect, offline queue, team sync). Everything a collaborator
//! needs goes through the methods here; everything the node observes comes
//! back as [`NodeEvent`]s from [`Node::subscribe`].

use crate::config::NodeConfig;
use crate::connection::{ConnectionManager, ConnectionOptions};
use crate::error::{CoreError, Result};
use crate::events::{DisconnectReason, EventBus, NodeEvent};
use crate::identity::{Identity, PeerId};
use crate::liveness::{Backoff, HeartbeatTracker, ReconnectSet, RetryOutcome};
use crate::peers::{PeerRecord, PeerTable};
use crate::protocol::{Message, SyncChange};
use crate::queue::{OfflineQueue, QueueEntry, QueuedSend};
use crate::sync::{TeamDataItem, TeamStore, TeamSummary, MEMBER_TYPE};
use crate::transfer::{MessageSink, Transfer, TransferManager, TransferOptions};
use crate::{lock, now_ms};
use discovery::{DiscoveryEngine, Sighting};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{LocalStorage, Storage};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use transport_tcp::bind_first_available;

const INBOUND_CHANNEL_CAPACITY: usize = 1024;
const PUNCH_WAIT: Duration = Duration::from_millis(300);

/// What happened to an outgoing message or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Offered { transfer_id: String },
    /// Parked in the offline queue
    Queued { entry_id: String },
}

/// A team invitation waiting for `accept_invitation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub team_id: String,
    pub team_name: String,
    /// The authenticated sender of the invitation
    pub inviter: PeerId,
    pub members: Vec<PeerId>,
}

pub struct Node {
    inner: Arc<NodeInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct ReplayGuard<'a> {
    replaying: &'a Mutex<HashSet<PeerId>>,
    peer_id: PeerId,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        lock(self.replaying).remove(&self.peer_id);
    }
}

struct NodeInner {
    config: NodeConfig,
    self_id: PeerId,
    tcp_port: u16,
    events: EventBus,
    peers: Arc<PeerTable>,
    conns: Arc<ConnectionManager>,
    transfers: TransferManager,
    teams: TeamStore,
    queue: OfflineQueue,
    heartbeats: HeartbeatTracker,
    reconnects: ReconnectSet,
    discovery: DiscoveryEngine,
    invitations: Mutex<HashMap<String, Invitation>>,
    /// Peers disconnected on request; never redialled automatically
    held: Mutex<HashSet<PeerId>>,
    /// Peers with a replay in flight, so entries are not delivered twice
    replaying: Mutex<HashSet<PeerId>>,
    token: CancellationToken,
}

impl Node {
    /// Start with on-disk identity and state under `config.data_dir`.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.ensure_data_dir()?;
        let identity = Identity::load_or_generate(&config.identity_path(), &config.keypair_path())?;
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(config.data_dir.clone())?);
        Self::start_with(config, identity, storage).await
    }

    /// Start with a caller-supplied identity and storage backend.
    pub async fn start_with(config: NodeConfig, identity: Identity, storage: Arc<dyn Storage>) -> Result<Self> {
        let identity = Arc::new(identity);
        let self_id = identity.peer_id().to_string();
        let (listener, tcp_port) = bind_first_available(&config.listen_host, &config.tcp_ports).await?;

        let token = CancellationToken::new();
        let events = EventBus::new();
        let (discovery, sightings) = DiscoveryEngine::new(config.discovery.clone(), &self_id, tcp_port);
        let peers = Arc::new(PeerTable::load(storage.clone()).await?);
        let teams = TeamStore::load(storage.clone(), &self_id).await?;
        let queue = OfflineQueue::load(storage, config.queue_max_retries).await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let conns = Arc::new(ConnectionManager::new(
            identity,
            peers.clone(),
            events.clone(),
            ConnectionOptions {
                handshake_timeout: config.handshake_timeout(),
                connect_timeout: config.connect_timeout(),
                write_timeout: config.write_timeout(),
                sign_messages: config.sign_messages,
            },
            discovery.payload().clone(),
            discovery.reporter().clone(),
            inbound_tx,
            token.clone(),
        ));
        let sink: Arc<dyn MessageSink> = conns.clone();
        let transfers = TransferManager::new(
            sink,
            events.clone(),
            TransferOptions {
                download_dir: config.download_dir.clone(),
                auto_accept: config.auto_accept_files,
                chunk_pause: config.chunk_pause(),
            },
            token.clone(),
        );
        let heartbeats = HeartbeatTracker::new(config.heartbeat_interval(), config.heartbeat_timeout());
        let reconnects = ReconnectSet::new(Backoff {
            base: config.reconnect_base_delay(),
            max: config.reconnect_max_delay(),
            max_attempts: config.reconnect_max_attempts.max(1),
        });

        let inner = Arc::new(NodeInner {
            config,
            self_id: self_id.clone(),
            tcp_port,
            events,
            peers,
            conns,
            transfers,
            teams,
            queue,
            heartbeats,
            reconnects,
            discovery,
            invitations: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            replaying: Mutex::new(HashSet::new()),
            token,
        });

        // Subscribe before anything can connect
        let watch_rx = inner.events.subscribe();
        let mut workers = vec![
            tokio::spawn(inner.clone().watch_connections(watch_rx)),
            tokio::spawn(inner.conns.clone().run_listener(listener)),
            tokio::spawn(inner.clone().handle_sightings(sightings)),
            tokio::spawn(inner.clone().dispatch(inbound_rx)),
            tokio::spawn(inner.clone().send_heartbeats()),
            tokio::spawn(inner.clone().sweep_liveness()),
            tokio::spawn(inner.clone().reconnect_loop()),
            tokio::spawn(inner.clone().queue_loop()),
            tokio::spawn(inner.clone().sync_loop()),
        ];
        workers.extend(inner.discovery.spawn(&inner.token));

        tracing::info!(peer_id = %self_id, tcp_port, "Node started");
        Ok(Self { inner, workers: Mutex::new(workers) })
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    /// TCP port the listener actually bound.
    pub fn port(&self) -> u16 {
        self.inner.tcp_port
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Send over an established connection. Fails with `DeliveryUnavailable`
    /// when the peer is not connected; see [`Node::send_or_queue`].
    pub async fn send(&self, peer_id: &str, message: Message) -> Result<()> {
        self.inner.conns.send(peer_id, &message).await.map_err(|e| match e {
            CoreError::NotConnected(peer) => CoreError::DeliveryUnavailable(peer),
            other => other,
        })
    }

    /// Send now if possible, otherwise park the message in the offline queue.
    pub async fn send_or_queue(&self, peer_id: &str, message: Message) -> Result<Delivery> {
        self.inner.send_or_queue(peer_id, message).await
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.conns.is_connected(peer_id)
    }

    pub fn get_connected_peers(&self) -> Vec<PeerId> {
        self.inner.conns.connected_peers()
    }

    // Peers

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.list()
    }

    /// Add a peer by address, for networks where discovery cannot reach.
    pub async fn add_peer(&self, peer_id: &str, addr: SocketAddr) -> Result<PeerRecord> {
        let record = self.inner.peers.add_manual(peer_id, addr, now_ms());
        self.inner.peers.persist().await?;
        Ok(record)
    }

    /// Probe an address and learn whoever answers.
    pub async fn probe(&self, addr: SocketAddr) -> Option<Sighting> {
        self.inner.discovery.probe(addr).await
    }

    /// Forget a peer: close its connection and drop it from every table.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<bool> {
        lock(&self.inner.held).insert(peer_id.to_string());
        self.inner.reconnects.remove(peer_id);
        self.inner.conns.disconnect(peer_id, DisconnectReason::Local);
        self.inner.heartbeats.purge(peer_id);
        let removed = self.inner.peers.remove(peer_id).is_some();
        if removed {
            self.inner.peers.persist().await?;
            tracing::info!(peer_id, "Removed peer");
        }
        Ok(removed)
    }

    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        lock(&self.inner.held).remove(peer_id);
        self.inner.conns.connect(peer_id).await
    }

    /// Close the connection; the peer is not redialled until `connect`.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        lock(&self.inner.held).insert(peer_id.to_string());
        self.inner.reconnects.remove(peer_id);
        self.inner.conns.disconnect(peer_id, DisconnectReason::Local)
    }

    // Files

    /// Offer a file, or queue the offer when the peer is offline.
    pub async fn offer_file(&self, peer_id: &str, path: &Path) -> Result<Delivery> {
        if !path.is_file() {
            return Err(CoreError::Transfer(path.display().to_string(), "not a readable file".into()));
        }
        if self.inner.conns.is_connected(peer_id) {
            match self.inner.transfers.offer_file(peer_id, path).await {
                Ok(transfer_id) => return Ok(Delivery::Offered { transfer_id }),
                Err(e @ (CoreError::NotConnected(_) | CoreError::Io(_) | CoreError::Frame(_))) => {
                    tracing::debug!(peer_id, error = %e, "Offer failed, queueing");
                }
                Err(e) => return Err(e),
            }
        }
        let path = path.canonicalize()?;
        let entry = self.inner.queue.enqueue(peer_id, QueuedSend::File { path }, now_ms()).await?;
        Ok(Delivery::Queued { entry_id: entry.id })
    }

    pub async fn accept_transfer(&self, transfer_id: &str) -> Result<()> {
        self.inner.transfers.accept_transfer(transfer_id).await
    }

    pub async fn reject_transfer(&self, transfer_id: &str) -> Result<()> {
        self.inner.transfers.reject_transfer(transfer_id, "rejected").await
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.transfers.transfers()
    }

    // Teams

    pub fn teams(&self) -> Vec<TeamSummary> {
        self.inner.teams.teams()
    }

    pub fn get_team_data(&self, team_id: &str, data_type: Option<&str>) -> Vec<TeamDataItem> {
        self.inner.teams.get(team_id, data_type)
    }

    /// Write one item locally; it reaches the other members on the next sync.
    pub async fn set_team_data(&self, team_id: &str, data_type: &str, data_key: &str, value: serde_json::Value) -> Result<SyncChange> {
        self.inner.require_member(team_id)?;
        self.inner.teams.set(team_id, data_type, data_key, value, now_ms()).await
    }

    pub async fn create_team(&self, name: &str) -> Result<String> {
        self.inner.teams.create_team(name, now_ms()).await
    }

    /// Add a peer to the roster and send it an invitation.
    pub async fn invite(&self, team_id: &str, peer_id: &str) -> Result<Delivery> {
        self.inner.require_member(team_id)?;
        self.inner.teams.add_member(team_id, peer_id, now_ms()).await?;
        let team_name = self
            .inner
            .teams
            .teams()
            .into_iter()
            .find(|t| t.team_id == team_id)
            .and_then(|t| t.name)
            .unwrap_or_default();
        let message = Message::TeamInvitation {
            team_id: team_id.to_string(),
            team_name,
            inviter: self.inner.self_id.clone(),
            members: self.inner.teams.members(team_id),
        };
        tracing::info!(team_id, peer_id, "Inviting peer");
        self.inner.send_or_queue(peer_id, message).await
    }

    /// Invitations received and not yet accepted or declined.
    pub fn invitations(&self) -> Vec<Invitation> {
        let mut out: Vec<_> = lock(&self.inner.invitations).values().cloned().collect();
        out.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        out
    }

    /// Join the team: seed the roster and ask the inviter for its data.
    pub async fn accept_invitation(&self, team_id: &str) -> Result<Delivery> {
        let invitation = lock(&self.inner.invitations)
            .remove(team_id)
            .ok_or_else(|| CoreError::UnknownInvitation(team_id.to_string()))?;
        self.inner
            .teams
            .seed_from_invitation(&invitation.team_id, &invitation.team_name, &invitation.members)
            .await?;
        tracing::info!(team_id, inviter = %invitation.inviter, "Accepted invitation");
        let request = Message::TeamDataRequest { team_id: invitation.team_id };
        self.inner.send_or_queue(&invitation.inviter, request).await
    }

    pub fn decline_invitation(&self, team_id: &str) -> bool {
        lock(&self.inner.invitations).remove(team_id).is_some()
    }

    pub async fn remove_team_member(&self, team_id: &str, peer_id: &str) -> Result<SyncChange> {
        self.inner.require_member(team_id)?;
        self.inner.teams.remove_member(team_id, peer_id, now_ms()).await
    }

    // Offline queue

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        self.inner.queue.entries()
    }

    pub async fn purge_failed_queue(&self) -> Result<usize> {
        self.inner.queue.purge_failed().await
    }

    /// Stop every worker, close connections and persist the peer table.
    /// Workers that outlive the shutdown timeout are aborted.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.token.is_cancelled() {
            return Ok(());
        }
        tracing::info!(peer_id = %self.inner.self_id, "Shutting down");
        self.inner.token.cancel();
        self.inner.conns.disconnect_all(DisconnectReason::Shutdown);

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.workers));
        handles.extend(self.inner.transfers.take_workers());
        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout();
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!("Worker did not stop in time, aborting");
                handle.abort();
            }
        }

        self.inner.peers.persist().await?;
        tracing::info!("Node stopped");
        Ok(())
    }
}

impl NodeInner {
    fn require_member(&self, team_id: &str) -> Result<()> {
        if self.teams.is_member(team_id, &self.self_id) {
            Ok(())
        } else {
            Err(CoreError::NotTeamMember(team_id.to_string()))
        }
    }

    /// Wait one period. False once the node is stopping.
    async fn tick(&self, period: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }

    async fn send_or_queue(&self, peer_id: &str, message: Message) -> Result<Delivery> {
        if self.conns.is_connected(peer_id) {
            match self.conns.send(peer_id, &message).await {
                Ok(()) => return Ok(Delivery::Sent),
                Err(e) => tracing::debug!(peer_id, error = %e, "Send failed, queueing"),
            }
        }
        let item = match message {
            Message::TeamDataSync { .. } | Message::TeamDataRequest { .. } | Message::TeamInvitation { .. } => {
                QueuedSend::TeamAction(message)
            }
            other => QueuedSend::Message(other),
        };
        let entry = self.queue.enqueue(peer_id, item, now_ms()).await?;
        Ok(Delivery::Queued { entry_id: entry.id })
    }

    // Workers

    async fn watch_connections(self: Arc<Self>, mut events: broadcast::Receiver<NodeEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(NodeEvent::PeerConnected { peer_id, .. }) => {
                    self.heartbeats.track(&peer_id, now_ms());
                    self.reconnects.remove(&peer_id);
                    lock(&self.held).remove(&peer_id);
                    tokio::spawn(self.clone().on_connected(peer_id));
                }
                Ok(NodeEvent::PeerDisconnected { peer_id, reason }) => {
                    self.heartbeats.forget(&peer_id);
                    self.transfers.peer_disconnected(&peer_id);
                    let redial = matches!(reason, DisconnectReason::Closed | DisconnectReason::Dead);
                    if redial && self.peers.is_known(&peer_id) && !lock(&self.held).contains(&peer_id) {
                        tracing::debug!(peer_id = %peer_id, "Scheduling reconnect");
                        self.reconnects.schedule(&peer_id, now_ms());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Connection watcher lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Resync teams we only know the roster of, then flush the peer's queue.
    async fn on_connected(self: Arc<Self>, peer_id: PeerId) {
        for team_id in self.teams.shared_teams(&peer_id) {
            if !self.teams.has_only_roster(&team_id) {
                continue;
            }
            tracing::debug!(peer_id = %peer_id, team_id = %team_id, "Requesting team resync");
            let request = Message::TeamDataRequest { team_id };
            if let Err(e) = self.conns.send(&peer_id, &request).await {
                tracing::debug!(peer_id = %peer_id, error = %e, "Resync request failed");
            }
        }
        self.replay(&peer_id).await;
    }

    async fn handle_sightings(self: Arc<Self>, mut sightings: mpsc::Receiver<Sighting>) {
        loop {
            let sighting = tokio::select! {
                _ = self.token.cancelled() => break,
                next = sightings.recv() => match next {
                    Some(s) => s,
                    None => break,
                },
            };
            let (record, is_new) = self.peers.upsert(&sighting, now_ms());
            if is_new {
                tracing::info!(peer_id = %record.id, address = %record.tcp_addr(), method = ?record.discovery_method, "Discovered peer");
                self.events.publish(NodeEvent::PeerDiscovered {
                    peer_id: record.id.clone(),
                    address: record.tcp_addr(),
                    method: sighting.method,
                });
                if let Err(e) = self.peers.persist().await {
                    tracing::warn!(error = %e, "Failed to persist peer table");
                }
            }
            self.maybe_dial(&record.id);
        }
    }

    fn maybe_dial(self: &Arc<Self>, peer_id: &str) {
        if !self.config.auto_connect
            || self.conns.is_connected(peer_id)
            || self.reconnects.contains(peer_id)
            || lock(&self.held).contains(peer_id)
        {
            return;
        }
        let conns = self.conns.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            match conns.connect(&peer_id).await {
                Ok(()) | Err(CoreError::DialInProgress(_)) => {}
                Err(e) => tracing::debug!(peer_id = %peer_id, error = %e, "Auto-connect failed"),
            }
        });
    }

    async fn dispatch(self: Arc<Self>, mut inbound: mpsc::Receiver<(PeerId, Message)>) {
        loop {
            let (peer_id, message) = tokio::select! {
                _ = self.token.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(m) => m,
                    None => break,
                },
            };
            let kind = message.kind();
            if let Err(e) = self.handle_message(&peer_id, message).await {
                tracing::warn!(peer_id = %peer_id, kind, error = %e, "Failed to handle message");
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, peer_id: &str, message: Message) -> Result<()> {
        match message {
            Message::Heartbeat { .. } => {
                if self.heartbeats.record_heartbeat(peer_id, now_ms()) {
                    tracing::info!(peer_id, "Peer is alive again");
                    self.events.publish(NodeEvent::PeerAlive { peer_id: peer_id.to_string() });
                }
            }
            Message::FileOffer { .. }
            | Message::FileAccept { .. }
            | Message::FileChunk { .. }
            | Message::FileComplete { .. }
            | Message::FileCancel { .. } => {
                self.transfers.handle_message(peer_id, message).await?;
            }
            Message::TeamDataSync { team_id, changes } => {
                if !self.teams.is_member(&team_id, &self.self_id) {
                    tracing::debug!(peer_id, team_id = %team_id, "Ignoring sync for a team we are not in");
                    return Ok(());
                }
                if !self.teams.is_member(&team_id, peer_id) {
                    tracing::debug!(peer_id, team_id = %team_id, "Ignoring sync from a non-member");
                    return Ok(());
                }
                let applied = self.teams.apply_batch(&team_id, &changes).await?;
                tracing::debug!(peer_id, team_id = %team_id, received = changes.len(), applied = applied.len(), "Applied team sync");
                for change in applied {
                    self.events.publish(NodeEvent::TeamDataApplied {
                        team_id: team_id.clone(),
                        change,
                        from: peer_id.to_string(),
                    });
                }
            }
            Message::TeamDataRequest { team_id } => {
                if !self.teams.is_member(&team_id, &self.self_id) || !self.teams.is_member(&team_id, peer_id) {
                    tracing::debug!(peer_id, team_id = %team_id, "Refusing team data request");
                    return Ok(());
                }
                let changes = self.teams.snapshot(&team_id);
                let conns = self.conns.clone();
                let peer_id = peer_id.to_string();
                // Large snapshots must not hold up the dispatcher
                tokio::spawn(async move {
                    if let Err(e) = conns.send(&peer_id, &Message::TeamDataSync { team_id, changes }).await {
                        tracing::debug!(peer_id = %peer_id, error = %e, "Team snapshot send failed");
                    }
                });
            }
            Message::TeamInvitation { team_id, team_name, inviter, members } => {
                if inviter != peer_id {
                    tracing::debug!(peer_id, claimed = %inviter, "Invitation names another inviter");
                }
                let invitation = Invitation {
                    team_id: team_id.clone(),
                    team_name: team_name.clone(),
                    inviter: peer_id.to_string(),
                    members: members.clone(),
                };
                lock(&self.invitations).insert(team_id.clone(), invitation);
                tracing::info!(peer_id, team_id = %team_id, team_name = %team_name, "Received team invitation");
                self.events.publish(NodeEvent::TeamInvitation {
                    team_id,
                    team_name,
                    inviter: peer_id.to_string(),
                    members,
                });
            }
            other @ (Message::Presence { .. } | Message::TypingIndicator { .. } | Message::Chat { .. }) => {
                self.events.publish(NodeEvent::MessageReceived { peer_id: peer_id.to_string(), message: other });
            }
        }
        Ok(())
    }

    async fn send_heartbeats(self: Arc<Self>) {
        let period = self.config.heartbeat_interval();
        while self.tick(period).await {
            let beat = Message::Heartbeat { timestamp: now_ms() };
            let mut sends = JoinSet::new();
            for peer_id in self.conns.connected_peers() {
                let conns = self.conns.clone();
                let beat = beat.clone();
                sends.spawn(async move {
                    if let Err(e) = conns.send(&peer_id, &beat).await {
                        tracing::debug!(peer_id = %peer_id, error = %e, "Heartbeat send failed");
                    }
                });
            }
            while sends.join_next().await.is_some() {}
        }
    }

    async fn sweep_liveness(self: Arc<Self>) {
        let period = self.config.poll_interval();
        while self.tick(period).await {
            for peer_id in self.heartbeats.sweep(now_ms()) {
                tracing::warn!(peer_id = %peer_id, "Peer missed its heartbeats, declaring dead");
                self.events.publish(NodeEvent::PeerDead { peer_id: peer_id.clone() });
                self.conns.disconnect(&peer_id, DisconnectReason::Dead);
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let period = self.config.poll_interval();
        while self.tick(period).await {
            for peer_id in self.reconnects.due(now_ms()) {
                if self.conns.is_connected(&peer_id) {
                    self.reconnects.remove(&peer_id);
                    continue;
                }
                let Some(record) = self.peers.get(&peer_id) else {
                    self.reconnects.remove(&peer_id);
                    continue;
                };
                if self.config.discovery.hole_punch_enabled {
                    self.discovery.punch(record.network_address, PUNCH_WAIT).await;
                }
                let attempt = tokio::select! {
                    _ = self.token.cancelled() => return,
                    result = self.conns.connect(&peer_id) => result,
                };
                match attempt {
                    Ok(()) => {
                        tracing::info!(peer_id = %peer_id, "Reconnected");
                        self.reconnects.remove(&peer_id);
                    }
                    Err(CoreError::DialInProgress(_)) => {}
                    Err(e) => match self.reconnects.record_failure(&peer_id, now_ms()) {
                        RetryOutcome::Retry(delay) => {
                            tracing::debug!(peer_id = %peer_id, error = %e, ?delay, "Reconnect failed, retrying");
                        }
                        RetryOutcome::Exhausted(attempts) => {
                            let exhausted = CoreError::RetryExhausted(peer_id.clone(), attempts);
                            tracing::warn!(peer_id = %peer_id, error = %exhausted, "Giving up on reconnect");
                            self.events.publish(NodeEvent::ReconnectFailed { peer_id, attempts });
                        }
                    },
                }
            }
        }
    }

    async fn queue_loop(self: Arc<Self>) {
        let period = self.config.queue_interval();
        while self.tick(period).await {
            let mut replays = JoinSet::new();
            for peer_id in self.queue.pending_peers() {
                if self.conns.is_connected(&peer_id) {
                    let inner = self.clone();
                    replays.spawn(async move { inner.replay(&peer_id).await });
                }
            }
            while replays.join_next().await.is_some() {}
        }
    }

    /// Try every pending entry for a connected peer, oldest first. Skipped
    /// when a replay for the same peer is already running.
    async fn replay(&self, peer_id: &str) {
        if !lock(&self.replaying).insert(peer_id.to_string()) {
            tracing::trace!(peer_id, "Replay already in flight");
            return;
        }
        let _guard = ReplayGuard { replaying: &self.replaying, peer_id: peer_id.to_string() };
        for entry in self.queue.pending_for(peer_id) {
            if self.token.is_cancelled() || !self.conns.is_connected(peer_id) {
                break;
            }
            let result = match &entry.item {
                QueuedSend::Message(message) | QueuedSend::TeamAction(message) => self.conns.send(peer_id, message).await,
                QueuedSend::File { path } => self.transfers.offer_file(peer_id, path).await.map(|_| ()),
            };
            let written = match result {
                Ok(()) => {
                    tracing::debug!(peer_id, entry_id = %entry.id, "Delivered queued entry");
                    self.queue.mark_delivered(&entry.id).await.map(|_| ())
                }
                Err(e) => match self.queue.record_failure(&entry.id, &e.to_string(), now_ms()).await {
                    Ok(Some(failed)) => {
                        self.events.publish(NodeEvent::QueueEntryFailed {
                            entry_id: failed.id,
                            peer_id: failed.peer_id,
                            retries: failed.retry_count,
                        });
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = written {
                tracing::warn!(peer_id, error = %e, "Failed to update offline queue");
            }
        }
    }

    async fn sync_loop(self: Arc<Self>) {
        let period = self.config.sync_interval();
        while self.tick(period).await {
            self.flush_team_changes().await;
        }
    }

    /// Push locally written changes to every other member. A member removed
    /// in this batch still gets the batch that removes it.
    async fn flush_team_changes(self: &Arc<Self>) {
        for (team_id, changes) in self.teams.drain_pending() {
            let mut recipients = self.teams.members(&team_id);
            recipients.extend(
                changes
                    .iter()
                    .filter(|c| c.data_type == MEMBER_TYPE && c.value.is_null())
                    .map(|c| c.data_key.clone()),
            );
            recipients.sort();
            recipients.dedup();
            recipients.retain(|p| *p != self.self_id);

            let message = Message::TeamDataSync { team_id: team_id.clone(), changes };
            let mut sends = JoinSet::new();
            for peer_id in recipients {
                let inner = self.clone();
                let message = message.clone();
                let team_id = team_id.clone();
                sends.spawn(async move {
                    match inner.send_or_queue(&peer_id, message).await {
                        Ok(Delivery::Queued { .. }) => tracing::debug!(peer_id = %peer_id, team_id = %team_id, "Team changes queued"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(peer_id = %peer_id, team_id = %team_id, error = %e, "Failed to queue team changes"),
                    }
                });
            }
            while sends.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery::DiscoveryConfig;
    use serde_json::json;
    use storage::MemoryStorage;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> NodeConfig {
        NodeConfig {
            listen_host: "127.0.0.1".into(),
            tcp_ports: vec![0],
            auto_accept_files: true,
            chunk_pause_ms: 0,
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 5_000,
            queue_interval_ms: 100,
            sync_interval_ms: 100,
            poll_interval_ms: 50,
            reconnect_base_delay_ms: 100,
            shutdown_timeout_ms: 1_000,
            discovery: DiscoveryConfig::disabled(),
            ..NodeConfig::with_data_dir(dir)
        }
    }

    async fn node(dir: &Path) -> Node {
        Node::start_with(test_config(dir), Identity::generate(), Arc::new(MemoryStorage::new()))
            .await
            .unwrap()
    }

    fn addr(node: &Node) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], node.port()))
    }

    /// Two nodes that know each other, `a` dialled `b`.
    async fn connected_pair(dir: &Path) -> (Node, Node) {
        let a = node(&dir.join("a")).await;
        let b = node(&dir.join("b")).await;
        a.add_peer(b.self_id(), addr(&b)).await.unwrap();
        b.add_peer(a.self_id(), addr(&a)).await.unwrap();
        a.connect(b.self_id()).await.unwrap();
        wait_until(|| b.is_connected(a.self_id())).await;
        (a, b)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn chat_reaches_the_other_node() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;
        let mut events = b.subscribe();

        let chat = Message::Chat { message_id: "m1".into(), text: "hello".into(), timestamp: 1 };
        assert_eq!(a.send_or_queue(b.self_id(), chat.clone()).await.unwrap(), Delivery::Sent);

        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
        match event {
            NodeEvent::MessageReceived { peer_id, message } => {
                assert_eq!(peer_id, a.self_id());
                assert_eq!(message, chat);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.get_connected_peers(), vec![b.self_id().to_string()]);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn send_to_offline_peer_is_unavailable_and_queue_replays_on_connect() {
        let temp = TempDir::new().unwrap();
        let a = node(&temp.path().join("a")).await;
        let b = node(&temp.path().join("b")).await;
        a.add_peer(b.self_id(), addr(&b)).await.unwrap();
        b.add_peer(a.self_id(), addr(&a)).await.unwrap();
        let mut events = b.subscribe();

        let chat = Message::Chat { message_id: "m1".into(), text: "later".into(), timestamp: 1 };
        let err = a.send(b.self_id(), chat.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::DeliveryUnavailable(_)));

        let queued = a.send_or_queue(b.self_id(), chat.clone()).await.unwrap();
        assert!(matches!(queued, Delivery::Queued { .. }));
        assert_eq!(a.queue_entries().len(), 1);
        // Waiting offline costs no retries
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.queue_entries()[0].retry_count, 0);

        a.connect(b.self_id()).await.unwrap();
        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;
        assert!(matches!(event, NodeEvent::MessageReceived { message, .. } if message == chat));
        wait_until(|| a.queue_entries().is_empty()).await;

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn file_offer_is_received_and_verified() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;
        let mut events = b.subscribe();

        let source = temp.path().join("notes.txt");
        std::fs::write(&source, b"hello world\n").unwrap();
        let delivery = a.offer_file(b.self_id(), &source).await.unwrap();
        assert!(matches!(delivery, Delivery::Offered { .. }));

        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::TransferComplete { .. })).await;
        let NodeEvent::TransferComplete { path: Some(path), .. } = event else {
            panic!("receiver should report a saved path");
        };
        assert_eq!(path, b.config().download_dir.join("notes.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world\n");
        wait_until(|| a.transfers().is_empty()).await;

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn offer_falls_back_to_the_queue_when_the_write_fails() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;
        let mut events = b.subscribe();
        let source = temp.path().join("late.txt");
        std::fs::write(&source, b"eventually").unwrap();

        a.inner.conns.shutdown_writer(b.self_id()).await;
        let delivery = a.offer_file(b.self_id(), &source).await.unwrap();
        assert!(matches!(delivery, Delivery::Queued { .. }));
        assert!(a.transfers().is_empty());
        assert!(matches!(&a.queue_entries()[0].item, QueuedSend::File { .. }));

        // Redial and replay deliver it
        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::TransferComplete { .. })).await;
        let NodeEvent::TransferComplete { path: Some(path), .. } = event else {
            panic!("receiver should report a saved path");
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"eventually");
        wait_until(|| a.queue_entries().is_empty()).await;

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn queued_file_that_vanished_fails_after_its_retries() {
        let temp = TempDir::new().unwrap();
        let config = NodeConfig { queue_max_retries: 1, ..test_config(&temp.path().join("a")) };
        let a = Node::start_with(config, Identity::generate(), Arc::new(MemoryStorage::new())).await.unwrap();
        let b = node(&temp.path().join("b")).await;
        a.add_peer(b.self_id(), addr(&b)).await.unwrap();
        b.add_peer(a.self_id(), addr(&a)).await.unwrap();
        let mut events = a.subscribe();

        let source = temp.path().join("gone.txt");
        std::fs::write(&source, b"soon deleted").unwrap();
        let Delivery::Queued { entry_id } = a.offer_file(b.self_id(), &source).await.unwrap() else {
            panic!("offline offer should be queued");
        };
        std::fs::remove_file(&source).unwrap();

        a.connect(b.self_id()).await.unwrap();
        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::QueueEntryFailed { .. })).await;
        match event {
            NodeEvent::QueueEntryFailed { entry_id: failed, peer_id, retries } => {
                assert_eq!(failed, entry_id);
                assert_eq!(peer_id, b.self_id());
                assert_eq!(retries, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let entries = a.queue_entries();
        assert_eq!(entries[0].status, crate::queue::QueueStatus::Failed);
        assert_eq!(a.purge_failed_queue().await.unwrap(), 1);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_is_declared_dead_then_alive_again() {
        let temp = TempDir::new().unwrap();
        // b beats far less often than a is willing to wait
        let a_config = NodeConfig { heartbeat_timeout_ms: 300, ..test_config(&temp.path().join("a")) };
        let b_config = NodeConfig { heartbeat_interval_ms: 1_000, ..test_config(&temp.path().join("b")) };
        let a = Node::start_with(a_config, Identity::generate(), Arc::new(MemoryStorage::new())).await.unwrap();
        let b = Node::start_with(b_config, Identity::generate(), Arc::new(MemoryStorage::new())).await.unwrap();
        let b_id = b.self_id().to_string();
        a.add_peer(&b_id, addr(&b)).await.unwrap();
        b.add_peer(a.self_id(), addr(&a)).await.unwrap();
        let mut events = a.subscribe();
        a.connect(&b_id).await.unwrap();

        match next_matching(&mut events, |e| matches!(e, NodeEvent::PeerDead { .. })).await {
            NodeEvent::PeerDead { peer_id } => assert_eq!(peer_id, b_id),
            other => panic!("unexpected {other:?}"),
        }
        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::PeerDisconnected { .. })).await;
        assert!(matches!(event, NodeEvent::PeerDisconnected { reason: DisconnectReason::Dead, .. }));

        // The reconnect brings heartbeats back
        match next_matching(&mut events, |e| matches!(e, NodeEvent::PeerAlive { .. })).await {
            NodeEvent::PeerAlive { peer_id } => assert_eq!(peer_id, b_id),
            other => panic!("unexpected {other:?}"),
        }

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sync_from_a_non_member_is_ignored() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;
        let mut events = a.subscribe();

        let team = a.create_team("Ops").await.unwrap();
        a.set_team_data(&team, "note", "owner", json!("a")).await.unwrap();
        let forged = SyncChange {
            data_type: "note".into(),
            data_key: "owner".into(),
            value: json!("b"),
            timestamp: now_ms() + 60_000,
            created_by: Some(b.self_id().to_string()),
        };
        let joined = SyncChange {
            data_type: MEMBER_TYPE.into(),
            data_key: b.self_id().to_string(),
            value: json!({ "joined_at": 1 }),
            timestamp: now_ms() + 60_000,
            created_by: Some(b.self_id().to_string()),
        };
        b.send(a.self_id(), Message::TeamDataSync { team_id: team.clone(), changes: vec![forged, joined] })
            .await
            .unwrap();

        // Messages from one peer are handled in order
        let chat = Message::Chat { message_id: "m1".into(), text: "after".into(), timestamp: 1 };
        b.send(a.self_id(), chat).await.unwrap();
        next_matching(&mut events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await;

        assert_eq!(a.get_team_data(&team, Some("note"))[0].value, json!("a"));
        assert!(!a.inner.teams.is_member(&team, b.self_id()));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invited_member_receives_team_data() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;
        let mut b_events = b.subscribe();

        let team = a.create_team("Design").await.unwrap();
        a.set_team_data(&team, "note", "agenda", json!("ship it")).await.unwrap();
        assert_eq!(a.invite(&team, b.self_id()).await.unwrap(), Delivery::Sent);

        next_matching(&mut b_events, |e| matches!(e, NodeEvent::TeamInvitation { .. })).await;
        assert_eq!(b.invitations().len(), 1);
        b.accept_invitation(&team).await.unwrap();
        wait_until(|| b.get_team_data(&team, Some("note")).len() == 1).await;
        assert_eq!(b.get_team_data(&team, Some("note"))[0].value, json!("ship it"));

        // Later writes flow through the sync worker
        a.set_team_data(&team, "note", "agenda", json!("ship it friday")).await.unwrap();
        wait_until(|| b.get_team_data(&team, Some("note"))[0].value == json!("ship it friday")).await;

        // And back
        b.set_team_data(&team, "note", "owner", json!("b")).await.unwrap();
        wait_until(|| a.get_team_data(&team, Some("note")).len() == 2).await;
        assert_eq!(b.teams()[0].name.as_deref(), Some("Design"));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn writes_require_membership() {
        let temp = TempDir::new().unwrap();
        let a = node(temp.path()).await;
        let err = a.set_team_data("nope", "note", "k", json!(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::NotTeamMember(_)));
        let err = a.accept_invitation("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownInvitation(_)));
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn remote_close_schedules_reconnect_but_local_disconnect_does_not() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;

        assert!(a.disconnect(b.self_id()));
        wait_until(|| !b.is_connected(a.self_id())).await;
        assert!(!a.inner.reconnects.contains(b.self_id()));
        // b saw the stream close and wants a back
        wait_until(|| b.inner.reconnects.contains(a.self_id()) || b.is_connected(a.self_id())).await;

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_and_disconnects() {
        let temp = TempDir::new().unwrap();
        let (a, b) = connected_pair(temp.path()).await;
        let mut events = b.subscribe();

        a.shutdown().await.unwrap();
        next_matching(&mut events, |e| matches!(e, NodeEvent::PeerDisconnected { .. })).await;
        assert!(!b.is_connected(a.self_id()));
        // Idempotent
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
