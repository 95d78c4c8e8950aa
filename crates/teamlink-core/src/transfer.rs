//! Chunked file transfer over the encrypted transport.
//!
//! offer -> accept -> chunk* -> complete. The receiver buffers chunks in
//! memory and only keeps the file on disk if its SHA-256 matches the offer.
//! Sending runs on its own task per transfer.

use crate::error::{CoreError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::identity::PeerId;
use crate::lock;
use crate::protocol::{chunk_bytes, Message};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Where the transfer layer hands messages for a peer.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, peer_id: &str, message: Message) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Offer sent or received, not yet accepted
    Offered,
    /// Chunks flowing
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub transfer_id: String,
    pub peer_id: PeerId,
    pub file_name: String,
    pub size: u64,
    pub hash: String,
    pub direction: TransferDirection,
    pub chunks_acked: u64,
    pub total_chunks: u64,
    pub state: TransferState,
}

struct Outgoing {
    info: Transfer,
    path: PathBuf,
    cancel: CancellationToken,
}

struct Incoming {
    info: Transfer,
    buffer: Vec<u8>,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn total_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Final path component of an untrusted name.
fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    match Path::new(&normalized).file_name().and_then(|n| n.to_str()) {
        Some(n) if !n.trim().is_empty() => n.to_string(),
        _ => "file".to_string(),
    }
}

fn numbered(name: &str, n: u32) -> String {
    let path = Path::new(name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension().and_then(|e| e.to_str())) {
        (Some(stem), Some(ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}

/// Create a fresh file for `name` in `dir`, inserting ` (n)` before the
/// extension while the name is taken.
async fn create_unique(dir: &Path, name: &str) -> std::io::Result<(tokio::fs::File, PathBuf)> {
    tokio::fs::create_dir_all(dir).await?;
    let base = sanitize_file_name(name);
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 { dir.join(&base) } else { dir.join(numbered(&base, n)) };
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && n < 10_000 => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Fill `buf` as far as the file allows.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub struct TransferOptions {
    pub download_dir: PathBuf,
    pub auto_accept: bool,
    pub chunk_pause: Duration,
}

pub struct TransferManager {
    sink: Arc<dyn MessageSink>,
    events: EventBus,
    opts: TransferOptions,
    outgoing: Arc<Mutex<HashMap<String, Outgoing>>>,
    incoming: Mutex<HashMap<String, Incoming>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
}

impl TransferManager {
    pub fn new(sink: Arc<dyn MessageSink>, events: EventBus, opts: TransferOptions, token: CancellationToken) -> Self {
        Self {
            sink,
            events,
            opts,
            outgoing: Arc::new(Mutex::new(HashMap::new())),
            incoming: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            token,
        }
    }

    /// Offer a file to a peer. Returns the transfer id.
    pub async fn offer_file(&self, peer_id: &str, path: &Path) -> Result<String> {
        let data = tokio::fs::read(path).await?;
        let file_name = sanitize_file_name(&path.to_string_lossy());
        let info = Transfer {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            file_name: file_name.clone(),
            size: data.len() as u64,
            hash: sha256_hex(&data),
            direction: TransferDirection::Send,
            chunks_acked: 0,
            total_chunks: total_chunks(data.len() as u64),
            state: TransferState::Offered,
        };
        drop(data);

        let offer = Message::FileOffer {
            transfer_id: info.transfer_id.clone(),
            name: file_name,
            size: info.size,
            hash: info.hash.clone(),
        };
        let transfer_id = info.transfer_id.clone();
        let (name, size) = (info.file_name.clone(), info.size);
        // Registered first so an immediate file_accept finds it
        lock(&self.outgoing).insert(
            transfer_id.clone(),
            Outgoing { info, path: path.to_path_buf(), cancel: self.token.child_token() },
        );
        if let Err(e) = self.sink.send_message(peer_id, offer).await {
            lock(&self.outgoing).remove(&transfer_id);
            return Err(e);
        }
        tracing::info!(peer_id, transfer_id = %transfer_id, name = %name, size, "Offered file");
        Ok(transfer_id)
    }

    /// Route one transfer message. Other message types are ignored.
    pub async fn handle_message(&self, peer_id: &str, message: Message) -> Result<()> {
        match message {
            Message::FileOffer { transfer_id, name, size, hash } => self.handle_offer(peer_id, transfer_id, name, size, hash).await,
            Message::FileAccept { transfer_id } => self.handle_accept(peer_id, &transfer_id),
            Message::FileChunk { transfer_id, index, data } => self.handle_chunk(peer_id, &transfer_id, index, &data).await,
            Message::FileComplete { transfer_id } => self.handle_complete(peer_id, &transfer_id).await,
            Message::FileCancel { transfer_id, reason } => {
                self.handle_cancel(peer_id, &transfer_id, &reason);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_offer(&self, peer_id: &str, transfer_id: String, name: String, size: u64, hash: String) -> Result<()> {
        let info = Transfer {
            transfer_id: transfer_id.clone(),
            peer_id: peer_id.to_string(),
            file_name: sanitize_file_name(&name),
            size,
            hash,
            direction: TransferDirection::Receive,
            chunks_acked: 0,
            total_chunks: total_chunks(size),
            state: TransferState::Offered,
        };
        {
            let mut incoming = lock(&self.incoming);
            if incoming.contains_key(&transfer_id) {
                tracing::debug!(transfer_id = %transfer_id, "Duplicate offer ignored");
                return Ok(());
            }
            incoming.insert(transfer_id.clone(), Incoming { info: info.clone(), buffer: Vec::new() });
        }
        tracing::info!(peer_id, transfer_id = %transfer_id, name = %info.file_name, size, "Received file offer");

        if self.opts.auto_accept {
            self.accept_transfer(&transfer_id).await
        } else {
            self.events.publish(NodeEvent::TransferOffered {
                peer_id: peer_id.to_string(),
                transfer_id,
                name: info.file_name,
                size,
            });
            Ok(())
        }
    }

    pub async fn accept_transfer(&self, transfer_id: &str) -> Result<()> {
        let peer_id = {
            let mut incoming = lock(&self.incoming);
            let entry = incoming
                .get_mut(transfer_id)
                .filter(|e| e.info.state == TransferState::Offered)
                .ok_or_else(|| CoreError::UnknownTransfer(transfer_id.to_string()))?;
            entry.info.state = TransferState::Active;
            entry.buffer.reserve(entry.info.size.min(64 * CHUNK_SIZE as u64) as usize);
            entry.info.peer_id.clone()
        };
        let accept = Message::FileAccept { transfer_id: transfer_id.to_string() };
        if let Err(e) = self.sink.send_message(&peer_id, accept).await {
            lock(&self.incoming).remove(transfer_id);
            self.fail(transfer_id, &format!("could not accept: {}", e));
            return Err(e);
        }
        Ok(())
    }

    pub async fn reject_transfer(&self, transfer_id: &str, reason: &str) -> Result<()> {
        let entry = lock(&self.incoming)
            .remove(transfer_id)
            .ok_or_else(|| CoreError::UnknownTransfer(transfer_id.to_string()))?;
        tracing::info!(transfer_id, reason, "Rejected file offer");
        self.cancel_remote(&entry.info.peer_id, transfer_id, reason).await;
        Ok(())
    }

    fn handle_accept(&self, peer_id: &str, transfer_id: &str) -> Result<()> {
        let job = {
            let mut outgoing = lock(&self.outgoing);
            let entry = outgoing
                .get_mut(transfer_id)
                .filter(|e| e.info.peer_id == peer_id && e.info.state == TransferState::Offered)
                .ok_or_else(|| CoreError::UnknownTransfer(transfer_id.to_string()))?;
            entry.info.state = TransferState::Active;
            SendJob {
                transfer_id: transfer_id.to_string(),
                peer_id: peer_id.to_string(),
                path: entry.path.clone(),
                size: entry.info.size,
                total_chunks: entry.info.total_chunks,
                pause: self.opts.chunk_pause,
                cancel: entry.cancel.clone(),
                sink: self.sink.clone(),
                events: self.events.clone(),
                outgoing: self.outgoing.clone(),
            }
        };
        tracing::debug!(peer_id, transfer_id, "Offer accepted, sending");
        let handle = tokio::spawn(job.run());
        let mut workers = lock(&self.workers);
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        Ok(())
    }

    async fn handle_chunk(&self, peer_id: &str, transfer_id: &str, index: u64, data: &str) -> Result<()> {
        let outcome = {
            let mut incoming = lock(&self.incoming);
            match incoming.get_mut(transfer_id) {
                None => Err("chunk for unknown transfer".to_string()),
                Some(e) if e.info.peer_id != peer_id || e.info.state != TransferState::Active => {
                    Err("chunk for a transfer that is not active".to_string())
                }
                Some(e) if index != e.info.chunks_acked => {
                    Err(format!("chunk {} out of order, expected {}", index, e.info.chunks_acked))
                }
                Some(e) => match chunk_bytes(data) {
                    Err(_) => Err("chunk data is not valid base64".to_string()),
                    Ok(bytes) if e.buffer.len() as u64 + bytes.len() as u64 > e.info.size => {
                        Err("chunk data exceeds the offered size".to_string())
                    }
                    Ok(bytes) => {
                        e.buffer.extend_from_slice(&bytes);
                        e.info.chunks_acked += 1;
                        Ok((e.info.chunks_acked, e.info.total_chunks))
                    }
                },
            }
        };

        match outcome {
            Ok((done, total)) => {
                self.events.publish(NodeEvent::TransferProgress { transfer_id: transfer_id.to_string(), done, total });
                Ok(())
            }
            Err(reason) => {
                let known = lock(&self.incoming).remove(transfer_id).is_some();
                tracing::warn!(peer_id, transfer_id, %reason, "Dropping transfer");
                if known {
                    self.fail(transfer_id, &reason);
                }
                self.cancel_remote(peer_id, transfer_id, &reason).await;
                Err(CoreError::Transfer(transfer_id.to_string(), reason))
            }
        }
    }

    async fn handle_complete(&self, peer_id: &str, transfer_id: &str) -> Result<()> {
        let entry = {
            let mut incoming = lock(&self.incoming);
            match incoming.get(transfer_id) {
                Some(e) if e.info.peer_id == peer_id && e.info.state == TransferState::Active => incoming.remove(transfer_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return Err(CoreError::UnknownTransfer(transfer_id.to_string()));
        };

        match self.store_verified(&entry).await {
            Ok(path) => {
                tracing::info!(peer_id, transfer_id, path = %path.display(), "File received");
                self.events.publish(NodeEvent::TransferComplete { transfer_id: transfer_id.to_string(), path: Some(path) });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(peer_id, transfer_id, error = %e, "File rejected");
                self.fail(transfer_id, &e.to_string());
                self.cancel_remote(peer_id, transfer_id, "integrity check failed").await;
                Err(e)
            }
        }
    }

    /// Write the buffered file, re-hash what is on disk and delete it on mismatch.
    async fn store_verified(&self, entry: &Incoming) -> Result<PathBuf> {
        let info = &entry.info;
        if entry.buffer.len() as u64 != info.size {
            return Err(CoreError::Transfer(
                info.transfer_id.clone(),
                format!("received {} of {} bytes", entry.buffer.len(), info.size),
            ));
        }

        let (mut file, path) = create_unique(&self.opts.download_dir, &info.file_name).await?;
        let written = async {
            use tokio::io::AsyncWriteExt;
            file.write_all(&entry.buffer).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::read(&path).await
        }
        .await;

        let on_disk = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e.into());
            }
        };
        let actual = sha256_hex(&on_disk);
        if !actual.eq_ignore_ascii_case(&info.hash) {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CoreError::TransferIntegrity {
                transfer_id: info.transfer_id.clone(),
                expected: info.hash.clone(),
                actual,
            });
        }
        Ok(path)
    }

    fn handle_cancel(&self, peer_id: &str, transfer_id: &str, reason: &str) {
        let outgoing = {
            let mut table = lock(&self.outgoing);
            match table.get(transfer_id) {
                Some(e) if e.info.peer_id == peer_id => table.remove(transfer_id),
                _ => None,
            }
        };
        if let Some(entry) = outgoing {
            entry.cancel.cancel();
            tracing::info!(peer_id, transfer_id, reason, "Peer cancelled transfer");
            self.fail(transfer_id, reason);
            return;
        }

        let incoming = {
            let mut table = lock(&self.incoming);
            match table.get(transfer_id) {
                Some(e) if e.info.peer_id == peer_id => table.remove(transfer_id),
                _ => None,
            }
        };
        if incoming.is_some() {
            tracing::info!(peer_id, transfer_id, reason, "Sender cancelled transfer");
            self.fail(transfer_id, reason);
        }
    }

    /// Fail everything in flight with a peer that went away.
    pub fn peer_disconnected(&self, peer_id: &str) {
        let dropped_out: Vec<Outgoing> = {
            let mut table = lock(&self.outgoing);
            let ids: Vec<_> = table
                .iter()
                .filter(|(_, e)| e.info.peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let dropped_in: Vec<Incoming> = {
            let mut table = lock(&self.incoming);
            let ids: Vec<_> = table.iter().filter(|(_, e)| e.info.peer_id == peer_id).map(|(id, _)| id.clone()).collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        for entry in dropped_out {
            entry.cancel.cancel();
            self.fail(&entry.info.transfer_id, "peer disconnected");
        }
        for entry in dropped_in {
            self.fail(&entry.info.transfer_id, "peer disconnected");
        }
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        let mut out: Vec<Transfer> = lock(&self.outgoing).values().map(|e| e.info.clone()).collect();
        out.extend(lock(&self.incoming).values().map(|e| e.info.clone()));
        out.sort_by(|a, b| a.transfer_id.cmp(&b.transfer_id));
        out
    }

    /// Sending tasks still registered, for the shutdown join.
    pub fn take_workers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.workers))
    }

    fn fail(&self, transfer_id: &str, reason: &str) {
        self.events.publish(NodeEvent::TransferFailed {
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
    }

    async fn cancel_remote(&self, peer_id: &str, transfer_id: &str, reason: &str) {
        let cancel = Message::FileCancel { transfer_id: transfer_id.to_string(), reason: reason.to_string() };
        if let Err(e) = self.sink.send_message(peer_id, cancel).await {
            tracing::debug!(peer_id, transfer_id, error = %e, "Could not deliver file_cancel");
        }
    }
}

struct SendJob {
    transfer_id: String,
    peer_id: PeerId,
    path: PathBuf,
    size: u64,
    total_chunks: u64,
    pause: Duration,
    cancel: CancellationToken,
    sink: Arc<dyn MessageSink>,
    events: EventBus,
    outgoing: Arc<Mutex<HashMap<String, Outgoing>>>,
}

impl SendJob {
    async fn run(self) {
        match self.send_all().await {
            Ok(true) => {
                lock(&self.outgoing).remove(&self.transfer_id);
                tracing::info!(peer_id = %self.peer_id, transfer_id = %self.transfer_id, chunks = self.total_chunks, "File sent");
                self.events.publish(NodeEvent::TransferComplete { transfer_id: self.transfer_id.clone(), path: None });
            }
            Ok(false) => {
                tracing::debug!(transfer_id = %self.transfer_id, "Send cancelled");
            }
            Err(e) => {
                lock(&self.outgoing).remove(&self.transfer_id);
                tracing::warn!(peer_id = %self.peer_id, transfer_id = %self.transfer_id, error = %e, "File send failed");
                self.events.publish(NodeEvent::TransferFailed {
                    transfer_id: self.transfer_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Ok(false) when cancelled part way.
    async fn send_all(&self) -> Result<bool> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent_bytes = 0u64;

        for index in 0..self.total_chunks {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let n = read_full(&mut file, &mut buf).await?;
            if n == 0 {
                return Err(CoreError::Transfer(self.transfer_id.clone(), "file shrank while sending".into()));
            }
            sent_bytes += n as u64;
            self.sink
                .send_message(&self.peer_id, Message::file_chunk(&self.transfer_id, index, &buf[..n]))
                .await?;

            if let Some(entry) = lock(&self.outgoing).get_mut(&self.transfer_id) {
                entry.info.chunks_acked = index + 1;
            }
            self.events.publish(NodeEvent::TransferProgress {
                transfer_id: self.transfer_id.clone(),
                done: index + 1,
                total: self.total_chunks,
            });

            if !self.pause.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(false),
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
        }

        if sent_bytes != self.size {
            return Err(CoreError::Transfer(self.transfer_id.clone(), "file changed size while sending".into()));
        }
        self.sink
            .send_message(&self.peer_id, Message::FileComplete { transfer_id: self.transfer_id.clone() })
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<(PeerId, Message)>);

    #[async_trait]
    impl MessageSink for ChannelSink {
        async fn send_message(&self, peer_id: &str, message: Message) -> Result<()> {
            self.0
                .send((peer_id.to_string(), message))
                .map_err(|_| CoreError::NotConnected(peer_id.to_string()))
        }
    }

    struct Side {
        manager: TransferManager,
        outbox: mpsc::UnboundedReceiver<(PeerId, Message)>,
        events: tokio::sync::broadcast::Receiver<NodeEvent>,
    }

    fn side(dir: &Path, auto_accept: bool) -> Side {
        let (tx, outbox) = mpsc::unbounded_channel();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let manager = TransferManager::new(
            Arc::new(ChannelSink(tx)),
            bus,
            TransferOptions { download_dir: dir.to_path_buf(), auto_accept, chunk_pause: Duration::ZERO },
            CancellationToken::new(),
        );
        Side { manager, outbox, events }
    }

    async fn next(outbox: &mut mpsc::UnboundedReceiver<(PeerId, Message)>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), outbox.recv()).await.unwrap().unwrap().1
    }

    async fn next_final(events: &mut tokio::sync::broadcast::Receiver<NodeEvent>) -> NodeEvent {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
            if matches!(ev, NodeEvent::TransferComplete { .. } | NodeEvent::TransferFailed { .. }) {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn twelve_byte_file_arrives_intact() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = src.path().join("notes.txt");
        let content = b"hello world\n";
        tokio::fs::write(&path, content).await.unwrap();
        let h = sha256_hex(content);

        let mut a = side(src.path(), false);
        let mut b = side(dst.path(), true);

        let id = a.manager.offer_file("b", &path).await.unwrap();
        let offer = next(&mut a.outbox).await;
        assert_eq!(offer, Message::FileOffer { transfer_id: id.clone(), name: "notes.txt".into(), size: 12, hash: h.clone() });
        b.manager.handle_message("a", offer).await.unwrap();

        let accept = next(&mut b.outbox).await;
        a.manager.handle_message("b", accept).await.unwrap();

        let chunk = next(&mut a.outbox).await;
        assert!(matches!(chunk, Message::FileChunk { index: 0, .. }));
        b.manager.handle_message("a", chunk).await.unwrap();
        let complete = next(&mut a.outbox).await;
        assert_eq!(complete, Message::FileComplete { transfer_id: id.clone() });
        b.manager.handle_message("a", complete).await.unwrap();

        let NodeEvent::TransferComplete { path: Some(saved), .. } = next_final(&mut b.events).await else {
            panic!("receiver did not complete");
        };
        let saved_bytes = tokio::fs::read(&saved).await.unwrap();
        assert_eq!(saved_bytes, content);
        assert_eq!(sha256_hex(&saved_bytes), h);
        assert!(matches!(next_final(&mut a.events).await, NodeEvent::TransferComplete { path: None, .. }));
        assert!(a.manager.transfers().is_empty());

        // A cancel arriving after the fact changes nothing
        a.manager.handle_message("b", Message::FileCancel { transfer_id: id, reason: "late".into() }).await.unwrap();
        assert!(a.manager.transfers().is_empty());
    }

    /// Records whether the transfer was already registered when its offer went out.
    #[derive(Default)]
    struct RegistrationSink {
        outgoing: Mutex<Option<Arc<Mutex<HashMap<String, Outgoing>>>>>,
        registered_at_offer: Mutex<Option<bool>>,
        refuse: bool,
    }

    #[async_trait]
    impl MessageSink for RegistrationSink {
        async fn send_message(&self, peer_id: &str, message: Message) -> Result<()> {
            if let Message::FileOffer { transfer_id, .. } = &message {
                let table = lock(&self.outgoing).clone().unwrap();
                let registered = lock(&table).contains_key(transfer_id);
                *lock(&self.registered_at_offer) = Some(registered);
            }
            if self.refuse {
                return Err(CoreError::NotConnected(peer_id.to_string()));
            }
            Ok(())
        }
    }

    fn registration_side(refuse: bool) -> (TransferManager, Arc<RegistrationSink>) {
        let sink = Arc::new(RegistrationSink { refuse, ..Default::default() });
        let dir = std::env::temp_dir();
        let manager = TransferManager::new(
            sink.clone(),
            EventBus::new(),
            TransferOptions { download_dir: dir, auto_accept: false, chunk_pause: Duration::ZERO },
            CancellationToken::new(),
        );
        *lock(&sink.outgoing) = Some(manager.outgoing.clone());
        (manager, sink)
    }

    #[tokio::test]
    async fn offer_is_registered_before_it_is_sent() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("a.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let (manager, sink) = registration_side(false);
        let id = manager.offer_file("b", &path).await.unwrap();
        assert_eq!(*lock(&sink.registered_at_offer), Some(true));
        assert_eq!(manager.transfers().len(), 1);

        // An accept on the heels of the offer starts the send
        manager.handle_message("b", Message::FileAccept { transfer_id: id }).await.unwrap();
        for worker in manager.take_workers() {
            worker.await.unwrap();
        }
        assert!(manager.transfers().is_empty());
    }

    #[tokio::test]
    async fn failed_offer_leaves_nothing_behind() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("a.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let (manager, sink) = registration_side(true);
        let err = manager.offer_file("b", &path).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected(_)));
        assert_eq!(*lock(&sink.registered_at_offer), Some(true));
        assert!(manager.transfers().is_empty());
    }

    #[tokio::test]
    async fn tampered_chunk_fails_and_leaves_no_file() {
        let dst = TempDir::new().unwrap();
        let mut b = side(dst.path(), true);
        let content = b"hello world\n";

        b.manager
            .handle_message("a", Message::FileOffer {
                transfer_id: "t1".into(),
                name: "notes.txt".into(),
                size: 12,
                hash: sha256_hex(content),
            })
            .await
            .unwrap();
        let mut tampered = content.to_vec();
        tampered[0] ^= 0xff;
        b.manager.handle_message("a", Message::file_chunk("t1", 0, &tampered)).await.unwrap();
        let err = b.manager.handle_message("a", Message::FileComplete { transfer_id: "t1".into() }).await.unwrap_err();
        assert!(matches!(err, CoreError::TransferIntegrity { .. }));

        assert!(matches!(next_final(&mut b.events).await, NodeEvent::TransferFailed { .. }));
        assert!(!dst.path().join("notes.txt").exists());
        let _accept = next(&mut b.outbox).await;
        assert!(matches!(next(&mut b.outbox).await, Message::FileCancel { .. }));
    }

    #[tokio::test]
    async fn multi_chunk_file_with_progress() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = src.path().join("blob.bin");
        let content: Vec<u8> = (0..(CHUNK_SIZE * 2 + 100)).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let mut a = side(src.path(), false);
        let mut b = side(dst.path(), true);
        a.manager.offer_file("b", &path).await.unwrap();
        b.manager.handle_message("a", next(&mut a.outbox).await).await.unwrap();
        a.manager.handle_message("b", next(&mut b.outbox).await).await.unwrap();

        let mut indexes = Vec::new();
        loop {
            let msg = next(&mut a.outbox).await;
            if let Message::FileChunk { index, .. } = &msg {
                indexes.push(*index);
            }
            let done = matches!(msg, Message::FileComplete { .. });
            b.manager.handle_message("a", msg).await.unwrap();
            if done {
                break;
            }
        }
        assert_eq!(indexes, vec![0, 1, 2]);

        let mut progress = Vec::new();
        loop {
            match b.events.recv().await.unwrap() {
                NodeEvent::TransferProgress { done, total, .. } => progress.push((done, total)),
                NodeEvent::TransferComplete { path: Some(p), .. } => {
                    assert_eq!(tokio::fs::read(p).await.unwrap(), content);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
        assert!(matches!(next_final(&mut a.events).await, NodeEvent::TransferComplete { path: None, .. }));
        assert!(a.manager.transfers().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_chunk_fails_the_transfer() {
        let dst = TempDir::new().unwrap();
        let mut b = side(dst.path(), true);
        b.manager
            .handle_message("a", Message::FileOffer { transfer_id: "t".into(), name: "x".into(), size: 10, hash: "00".into() })
            .await
            .unwrap();
        assert!(b.manager.handle_message("a", Message::file_chunk("t", 1, b"abc")).await.is_err());
        assert!(matches!(next_final(&mut b.events).await, NodeEvent::TransferFailed { .. }));
        assert!(b.manager.transfers().is_empty());
    }

    #[tokio::test]
    async fn rejected_offer_tells_the_sender() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("a.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let mut a = side(src.path(), false);
        let mut b = side(src.path(), false);

        let id = a.manager.offer_file("b", &path).await.unwrap();
        b.manager.handle_message("a", next(&mut a.outbox).await).await.unwrap();
        assert!(matches!(b.events.recv().await.unwrap(), NodeEvent::TransferOffered { .. }));

        b.manager.reject_transfer(&id, "not now").await.unwrap();
        a.manager.handle_message("b", next(&mut b.outbox).await).await.unwrap();
        match next_final(&mut a.events).await {
            NodeEvent::TransferFailed { transfer_id, reason } => {
                assert_eq!(transfer_id, id);
                assert_eq!(reason, "not now");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(b.manager.accept_transfer(&id).await, Err(CoreError::UnknownTransfer(_))));
    }

    #[tokio::test]
    async fn colliding_names_get_a_counter() {
        let dir = TempDir::new().unwrap();
        let (_f1, p1) = create_unique(dir.path(), "../../etc/notes.txt").await.unwrap();
        let (_f2, p2) = create_unique(dir.path(), "notes.txt").await.unwrap();
        let (_f3, p3) = create_unique(dir.path(), "notes.txt").await.unwrap();
        assert_eq!(p1, dir.path().join("notes.txt"));
        assert_eq!(p2, dir.path().join("notes (1).txt"));
        assert_eq!(p3, dir.path().join("notes (2).txt"));
        assert_eq!(sanitize_file_name("..\\evil\\x.bin"), "x.bin");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(numbered("README", 1), "README (1)");
    }
}
