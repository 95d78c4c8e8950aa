//! Live TCP connections, one per peer.
//!
//! The manager owns the listener, dials known peers, runs the handshake and
//! key exchange, and keeps a table of registered connections. Each connection
//! has a receive task that opens `encrypted` frames and forwards the decoded
//! messages to the node; writes go through a per-connection writer lock.

use crate::crypto::EncryptionSession;
use crate::error::{CoreError, HandshakeError, Result};
use crate::events::{Direction, DisconnectReason, EventBus, NodeEvent};
use crate::handshake::{self, Opening, RejectReason};
use crate::identity::{Identity, PeerId};
use crate::lock;
use crate::now_ms;
use crate::peers::PeerTable;
use crate::protocol::{Message, WireFrame};
use crate::transfer::MessageSink;
use async_trait::async_trait;
use discovery::{DiscoveryMethod, DiscoveryPayload, Reporter};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use transport_tcp::{connect_timeout, read_json, write_json, FrameError};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Bound on a single frame write
    pub write_timeout: Duration,
    pub sign_messages: bool,
}

/// Public view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub direction: Direction,
    pub established_at: u64,
    pub remote_addr: SocketAddr,
}

struct Connection {
    serial: u64,
    info: ConnectionInfo,
    /// Peer id of the side that dialled
    initiator: PeerId,
    session: Arc<EncryptionSession>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reader: Option<AbortHandle>,
}

impl Connection {
    fn close(self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        let writer = self.writer;
        tokio::spawn(async move {
            let _ = writer.lock().await.shutdown().await;
        });
    }
}

/// Clears the in-flight dial marker on every exit path.
struct DialGuard<'a> {
    dialing: &'a Mutex<HashSet<PeerId>>,
    peer_id: PeerId,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        lock(self.dialing).remove(&self.peer_id);
    }
}

pub struct ConnectionManager {
    identity: Arc<Identity>,
    peers: Arc<PeerTable>,
    events: EventBus,
    opts: ConnectionOptions,
    local_payload: DiscoveryPayload,
    reporter: Reporter,
    table: Mutex<HashMap<PeerId, Connection>>,
    dialing: Mutex<HashSet<PeerId>>,
    serial: AtomicU64,
    inbound_tx: mpsc::Sender<(PeerId, Message)>,
    token: CancellationToken,
}

impl ConnectionManager {
    /// `local_payload` and `reporter` let the listener answer subnet-scan probes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        peers: Arc<PeerTable>,
        events: EventBus,
        opts: ConnectionOptions,
        local_payload: DiscoveryPayload,
        reporter: Reporter,
        inbound_tx: mpsc::Sender<(PeerId, Message)>,
        token: CancellationToken,
    ) -> Self {
        Self {
            identity,
            peers,
            events,
            opts,
            local_payload,
            reporter,
            table: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            serial: AtomicU64::new(1),
            inbound_tx,
            token,
        }
    }

    pub fn self_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// Accept loop. Each inbound socket is handled on its own task.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_inbound(stream, addr).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::debug!("Listener stopped");
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        let timeout = self.opts.handshake_timeout;
        let peer_id = match handshake::read_opening(&mut stream, timeout).await {
            Ok(Opening::Probe { peer_id, preferred_tcp_port }) => {
                let answer = WireFrame::Discovery {
                    peer_id: self.local_payload.peer_id.clone(),
                    preferred_tcp_port: self.local_payload.preferred_tcp_port,
                };
                if let Err(e) = write_json(&mut stream, &answer).await {
                    tracing::debug!(%addr, error = %e, "Could not answer probe");
                }
                self.reporter.report(DiscoveryPayload::new(peer_id, preferred_tcp_port), addr, DiscoveryMethod::SubnetScan);
                return;
            }
            Ok(Opening::Handshake { peer_id }) => peer_id,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "Dropping inbound socket");
                return;
            }
        };

        if let Some(reason) = self.validate(&peer_id) {
            tracing::info!(%addr, peer_id = %peer_id, reason = reason.as_str(), "Handshake rejected");
            let _ = handshake::reject(&mut stream, &self.identity, reason, timeout).await;
            return;
        }

        match handshake::accept(&mut stream, &self.identity, &peer_id, timeout).await {
            Ok(session) => {
                self.register(peer_id, Direction::Inbound, stream, addr, session);
            }
            Err(e) => tracing::warn!(%addr, peer_id = %peer_id, error = %e, "Inbound handshake failed"),
        }
    }

    fn validate(&self, peer_id: &str) -> Option<RejectReason> {
        if peer_id == self.self_id() {
            Some(RejectReason::SelfConnection)
        } else if !self.peers.is_known(peer_id) {
            Some(RejectReason::UnknownPeer)
        } else if self.is_connected(peer_id) {
            Some(RejectReason::AlreadyConnected)
        } else {
            None
        }
    }

    /// Dial a known peer and register the connection. A no-op if already connected.
    pub async fn connect(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        if self.is_connected(peer_id) {
            return Ok(());
        }
        if peer_id == self.self_id() {
            return Err(CoreError::HandshakeRejected {
                peer_id: peer_id.to_string(),
                reason: RejectReason::SelfConnection.as_str().to_string(),
            });
        }
        let record = self.peers.get(peer_id).ok_or_else(|| CoreError::UnknownPeer(peer_id.to_string()))?;

        if !lock(&self.dialing).insert(peer_id.to_string()) {
            return Err(CoreError::DialInProgress(peer_id.to_string()));
        }
        let _guard = DialGuard { dialing: &self.dialing, peer_id: peer_id.to_string() };

        let addr = record.tcp_addr();
        tracing::debug!(peer_id, %addr, "Dialling");
        let mut stream = connect_timeout(addr, self.opts.connect_timeout).await?;
        let session = handshake::initiate(&mut stream, &self.identity, peer_id, self.opts.handshake_timeout).await?;
        self.register(peer_id.to_string(), Direction::Outbound, stream, addr, session);
        if self.is_connected(peer_id) {
            Ok(())
        } else {
            Err(CoreError::Handshake(HandshakeError::Unexpected("connection closed during registration".into())))
        }
    }

    /// Register a freshly negotiated connection and start its receive task.
    ///
    /// When a connection for the peer already exists, the one dialled by the
    /// lower peer id survives at both ends and the other is closed silently.
    fn register(self: &Arc<Self>, peer_id: PeerId, direction: Direction, stream: TcpStream, addr: SocketAddr, session: EncryptionSession) {
        let (read, write) = stream.into_split();
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let initiator = match direction {
            Direction::Outbound => self.self_id().to_string(),
            Direction::Inbound => peer_id.clone(),
        };
        let session = Arc::new(session);
        let conn = Connection {
            serial,
            info: ConnectionInfo { peer_id: peer_id.clone(), direction, established_at: now_ms(), remote_addr: addr },
            initiator: initiator.clone(),
            session: session.clone(),
            writer: Arc::new(tokio::sync::Mutex::new(write)),
            reader: None,
        };

        let keeper = std::cmp::min(self.self_id(), peer_id.as_str()).to_string();
        let (replaced, fresh) = {
            let mut table = lock(&self.table);
            let wins = table
                .get(&peer_id)
                .map(|existing| existing.initiator != initiator && initiator == keeper);
            match wins {
                Some(false) => {
                    drop(table);
                    tracing::debug!(peer_id = %peer_id, "Duplicate connection closed");
                    conn.close();
                    return;
                }
                Some(true) => (table.insert(peer_id.clone(), conn), false),
                None => {
                    table.insert(peer_id.clone(), conn);
                    (None, true)
                }
            }
        };
        if let Some(old) = replaced {
            tracing::debug!(peer_id = %peer_id, "Replaced racing connection");
            old.close();
        }

        let this = self.clone();
        let reader_peer = peer_id.clone();
        let handle = tokio::spawn(async move { this.read_loop(reader_peer, serial, read, session).await });
        if let Some(entry) = lock(&self.table).get_mut(&peer_id).filter(|c| c.serial == serial) {
            entry.reader = Some(handle.abort_handle());
        }

        self.peers.touch(&peer_id, now_ms());
        if fresh {
            tracing::info!(peer_id = %peer_id, ?direction, %addr, "Peer connected");
            self.events.publish(NodeEvent::PeerConnected { peer_id, direction });
        }
    }

    async fn read_loop(self: Arc<Self>, peer_id: PeerId, serial: u64, mut read: OwnedReadHalf, session: Arc<EncryptionSession>) {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => return,
                frame = read_json::<_, WireFrame>(&mut read) => frame,
            };
            match frame {
                Ok(WireFrame::Encrypted { payload, signature }) => match session.open_message(&payload, signature.as_deref()) {
                    Ok(message) => {
                        if self.inbound_tx.send((peer_id.clone(), message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => self.reject_frame(&peer_id, e.to_string()),
                },
                Ok(other) => self.reject_frame(&peer_id, format!("unexpected {} frame", other.kind())),
                // The length prefix keeps the stream aligned past a bad body
                Err(FrameError::Json(e)) => self.reject_frame(&peer_id, format!("malformed frame: {}", e)),
                Err(e) => {
                    if e.is_eof() {
                        tracing::debug!(peer_id = %peer_id, "Peer closed the connection");
                    } else {
                        tracing::warn!(peer_id = %peer_id, error = %e, "Connection read failed");
                    }
                    break;
                }
            }
        }
        self.remove_connection(&peer_id, Some(serial), DisconnectReason::Closed);
    }

    fn reject_frame(&self, peer_id: &str, reason: String) {
        tracing::warn!(peer_id, %reason, "Message rejected");
        self.events.publish(NodeEvent::MessageRejected { peer_id: peer_id.to_string(), reason });
    }

    /// Encrypt and write one message. Fails immediately if the peer has no connection.
    pub async fn send(&self, peer_id: &str, message: &Message) -> Result<()> {
        let (serial, session, writer) = {
            let table = lock(&self.table);
            let conn = table.get(peer_id).ok_or_else(|| CoreError::NotConnected(peer_id.to_string()))?;
            (conn.serial, conn.session.clone(), conn.writer.clone())
        };
        let signer = self.opts.sign_messages.then_some(self.identity.as_ref());
        let frame = session.seal_message(message, signer)?;

        // Waiting behind a stalled write counts against the same bound
        let written = tokio::time::timeout(self.opts.write_timeout, async {
            let mut w = writer.lock().await;
            write_json(&mut *w, &frame).await
        })
        .await;
        match written {
            Ok(Ok(())) => {
                tracing::trace!(peer_id, kind = message.kind(), "Sent");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(peer_id, error = %e, "Write failed, dropping connection");
                self.remove_connection(peer_id, Some(serial), DisconnectReason::Closed);
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(peer_id, "Write timed out, dropping connection");
                self.remove_connection(peer_id, Some(serial), DisconnectReason::Closed);
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out").into())
            }
        }
    }

    /// Close our write half while leaving the connection registered.
    #[cfg(test)]
    pub(crate) async fn shutdown_writer(&self, peer_id: &str) {
        let writer = lock(&self.table).get(peer_id).map(|c| c.writer.clone());
        if let Some(writer) = writer {
            let _ = writer.lock().await.shutdown().await;
        }
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        lock(&self.table).contains_key(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = lock(&self.table).keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn connection_info(&self, peer_id: &str) -> Option<ConnectionInfo> {
        lock(&self.table).get(peer_id).map(|c| c.info.clone())
    }

    /// Close the peer's connection. Returns false if there was none.
    pub fn disconnect(&self, peer_id: &str, reason: DisconnectReason) -> bool {
        self.remove_connection(peer_id, None, reason)
    }

    pub fn disconnect_all(&self, reason: DisconnectReason) {
        for peer_id in self.connected_peers() {
            self.disconnect(&peer_id, reason);
        }
    }

    /// Tear down the entry if it is still the one identified by `serial`.
    fn remove_connection(&self, peer_id: &str, serial: Option<u64>, reason: DisconnectReason) -> bool {
        let removed = {
            let mut table = lock(&self.table);
            match table.get(peer_id) {
                Some(c) if serial.map_or(true, |s| s == c.serial) => table.remove(peer_id),
                _ => None,
            }
        };
        let Some(conn) = removed else {
            return false;
        };
        conn.close();
        tracing::info!(peer_id, ?reason, "Peer disconnected");
        self.events.publish(NodeEvent::PeerDisconnected { peer_id: peer_id.to_string(), reason });
        true
    }
}

#[async_trait]
impl MessageSink for ConnectionManager {
    async fn send_message(&self, peer_id: &str, message: Message) -> Result<()> {
        self.send(peer_id, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;
    use tokio::sync::broadcast;

    struct Side {
        conns: Arc<ConnectionManager>,
        inbound: mpsc::Receiver<(PeerId, Message)>,
        events: broadcast::Receiver<NodeEvent>,
        sightings: mpsc::Receiver<discovery::Sighting>,
        port: u16,
        token: CancellationToken,
    }

    async fn side() -> Side {
        let identity = Arc::new(Identity::generate());
        let peers = Arc::new(PeerTable::load(Arc::new(MemoryStorage::new())).await.unwrap());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let (listener, port) = transport_tcp::bind_first_available("127.0.0.1", &[0]).await.unwrap();
        let (sight_tx, sightings) = mpsc::channel(16);
        let (inbound_tx, inbound) = mpsc::channel(64);
        let token = CancellationToken::new();
        let conns = Arc::new(ConnectionManager::new(
            identity.clone(),
            peers,
            bus,
            ConnectionOptions {
                handshake_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(2),
                write_timeout: Duration::from_secs(5),
                sign_messages: true,
            },
            DiscoveryPayload::new(identity.peer_id(), port),
            Reporter::new(identity.peer_id(), sight_tx),
            inbound_tx,
            token.clone(),
        ));
        tokio::spawn(conns.clone().run_listener(listener));
        Side { conns, inbound, events, sightings, port, token }
    }

    fn introduce(a: &Side, b: &Side) {
        a.conns.peers.add_manual(b.conns.self_id(), ([127, 0, 0, 1], b.port).into(), 1);
        b.conns.peers.add_manual(a.conns.self_id(), ([127, 0, 0, 1], a.port).into(), 1);
    }

    async fn wait_connected(side: &mut Side) -> PeerId {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), side.events.recv()).await.unwrap().unwrap();
            if let NodeEvent::PeerConnected { peer_id, .. } = ev {
                return peer_id;
            }
        }
    }

    #[tokio::test]
    async fn handshake_connects_both_sides_and_messages_flow() {
        let mut a = side().await;
        let mut b = side().await;
        introduce(&a, &b);
        let b_id = b.conns.self_id().to_string();
        let a_id = a.conns.self_id().to_string();

        a.conns.connect(&b_id).await.unwrap();
        assert_eq!(wait_connected(&mut b).await, a_id);
        assert!(a.conns.is_connected(&b_id));
        assert!(b.conns.is_connected(&a_id));
        assert_eq!(a.conns.connection_info(&b_id).unwrap().direction, Direction::Outbound);
        assert_eq!(b.conns.connection_info(&a_id).unwrap().direction, Direction::Inbound);

        for n in 0..3 {
            a.conns.send(&b_id, &Message::Heartbeat { timestamp: n }).await.unwrap();
        }
        for n in 0..3 {
            let (from, msg) = b.inbound.recv().await.unwrap();
            assert_eq!(from, a_id);
            assert_eq!(msg, Message::Heartbeat { timestamp: n });
        }
        b.conns.send(&a_id, &Message::Presence { status: "away".into() }).await.unwrap();
        assert_eq!(a.inbound.recv().await.unwrap().1, Message::Presence { status: "away".into() });
        a.token.cancel();
        b.token.cancel();
    }

    async fn write_raw(side: &Side, peer_id: &str, frame: &WireFrame) {
        let writer = lock(&side.conns.table).get(peer_id).unwrap().writer.clone();
        write_json(&mut *writer.lock().await, frame).await.unwrap();
    }

    async fn next_rejection(side: &mut Side) -> String {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), side.events.recv()).await.unwrap().unwrap();
            if let NodeEvent::MessageRejected { reason, .. } = ev {
                return reason;
            }
        }
    }

    #[tokio::test]
    async fn bad_frames_are_rejected_and_the_channel_survives() {
        let a = side().await;
        let mut b = side().await;
        introduce(&a, &b);
        let a_id = a.conns.self_id().to_string();
        let b_id = b.conns.self_id().to_string();
        a.conns.connect(&b_id).await.unwrap();
        wait_connected(&mut b).await;

        let session = lock(&a.conns.table).get(&b_id).unwrap().session.clone();
        let message = Message::Presence { status: "busy".into() };

        // Flipped ciphertext byte, unsigned
        let WireFrame::Encrypted { payload, .. } = session.seal_message(&message, None).unwrap() else {
            panic!("seal_message returns an encrypted frame");
        };
        let mut sealed = crate::crypto::decode_b64(&payload).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        write_raw(&a, &b_id, &WireFrame::Encrypted { payload: crate::crypto::encode_b64(&sealed), signature: None }).await;
        next_rejection(&mut b).await;

        // Intact ciphertext signed by someone else
        let WireFrame::Encrypted { payload, .. } = session.seal_message(&message, None).unwrap() else {
            panic!("seal_message returns an encrypted frame");
        };
        let forged = crate::crypto::sign_b64(&Identity::generate(), &crate::crypto::decode_b64(&payload).unwrap());
        write_raw(&a, &b_id, &WireFrame::Encrypted { payload, signature: Some(forged) }).await;
        next_rejection(&mut b).await;

        assert!(b.inbound.try_recv().is_err());
        assert!(b.conns.is_connected(&a_id));
        a.conns.send(&b_id, &message).await.unwrap();
        let (from, got) = tokio::time::timeout(Duration::from_secs(5), b.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(from, a_id);
        assert_eq!(got, message);
        a.token.cancel();
        b.token.cancel();
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected() {
        let a = side().await;
        let b = side().await;
        // b knows nothing about a
        a.conns.peers.add_manual(b.conns.self_id(), ([127, 0, 0, 1], b.port).into(), 1);
        let err = a.conns.connect(b.conns.self_id()).await.unwrap_err();
        match err {
            CoreError::HandshakeRejected { reason, .. } => assert_eq!(reason, "unknown peer"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!a.conns.is_connected(b.conns.self_id()));
        assert!(b.conns.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn send_without_connection_fails_fast() {
        let a = side().await;
        let err = a.conns.send("nobody", &Message::Heartbeat { timestamp: 0 }).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected(_)));
        assert!(matches!(a.conns.connect("nobody").await, Err(CoreError::UnknownPeer(_))));
        let own = a.conns.self_id().to_string();
        assert!(matches!(a.conns.connect(&own).await, Err(CoreError::HandshakeRejected { .. })));
    }

    #[tokio::test]
    async fn remote_close_fires_disconnect() {
        let mut a = side().await;
        let mut b = side().await;
        introduce(&a, &b);
        let b_id = b.conns.self_id().to_string();
        let a_id = a.conns.self_id().to_string();
        a.conns.connect(&b_id).await.unwrap();
        wait_connected(&mut b).await;

        assert!(b.conns.disconnect(&a_id, DisconnectReason::Local));
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), a.events.recv()).await.unwrap().unwrap();
            if let NodeEvent::PeerDisconnected { peer_id, reason } = ev {
                assert_eq!(peer_id, b_id);
                assert_eq!(reason, DisconnectReason::Closed);
                break;
            }
        }
        assert!(!a.conns.is_connected(&b_id));
        assert!(!b.conns.disconnect(&a_id, DisconnectReason::Local));
    }

    #[tokio::test]
    async fn listener_answers_scan_probes() {
        let mut b = side().await;
        let addr: SocketAddr = ([127, 0, 0, 1], b.port).into();
        let found = discovery::scan::probe(addr, &DiscoveryPayload::new("scanner", 4242), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.peer_id, b.conns.self_id());
        let sighting = b.sightings.recv().await.unwrap();
        assert_eq!(sighting.peer_id, "scanner");
        assert_eq!(sighting.port, 4242);
        assert_eq!(sighting.method, DiscoveryMethod::SubnetScan);
    }

    #[tokio::test]
    async fn simultaneous_dials_settle_on_one_connection() {
        let a = side().await;
        let mut b = side().await;
        introduce(&a, &b);
        let a_id = a.conns.self_id().to_string();
        let b_id = b.conns.self_id().to_string();

        let (ra, rb) = tokio::join!(a.conns.connect(&b_id), b.conns.connect(&a_id));
        assert!(ra.is_ok() || rb.is_ok());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(a.conns.is_connected(&b_id));
        assert!(b.conns.is_connected(&a_id));
        // Both ends agree on the same physical connection
        let a_dir = a.conns.connection_info(&b_id).unwrap().direction;
        let b_dir = b.conns.connection_info(&a_id).unwrap().direction;
        assert_ne!(a_dir, b_dir);

        a.conns.send(&b_id, &Message::Heartbeat { timestamp: 7 }).await.unwrap();
        let (_, msg) = tokio::time::timeout(Duration::from_secs(5), b.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(msg, Message::Heartbeat { timestamp: 7 });
    }
}
