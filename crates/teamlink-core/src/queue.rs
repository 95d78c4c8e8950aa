//! Durable offline queue.
//!
//! Sends whose target is unreachable are parked here and replayed when the
//! peer is connected again. Every mutation is written through to storage;
//! entries that hit the retry ceiling stay as `failed` until purged.

use crate::error::Result;
use crate::identity::PeerId;
use crate::protocol::Message;
use crate::{load_json, lock, store_json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use storage::Storage;

const QUEUE_KEY: &str = "offline_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Message,
    File,
    TeamAction,
}

/// What to replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum QueuedSend {
    Message(Message),
    /// Offer this file again
    File { path: PathBuf },
    /// Team data or invitation traffic
    TeamAction(Message),
}

impl QueuedSend {
    pub fn kind(&self) -> QueueKind {
        match self {
            QueuedSend::Message(_) => QueueKind::Message,
            QueuedSend::File { .. } => QueueKind::File,
            QueuedSend::TeamAction(_) => QueueKind::TeamAction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub peer_id: PeerId,
    pub item: QueuedSend,
    pub retry_count: u32,
    pub last_retry: Option<u64>,
    pub status: QueueStatus,
    pub created_at: u64,
    pub last_error: Option<String>,
}

pub struct OfflineQueue {
    entries: Mutex<Vec<QueueEntry>>,
    storage: Arc<dyn Storage>,
    /// Held from snapshot to `put` so writes land in mutation order
    persist_lock: tokio::sync::Mutex<()>,
    max_retries: u32,
}

impl OfflineQueue {
    pub async fn load(storage: Arc<dyn Storage>, max_retries: u32) -> Result<Self> {
        let entries: Vec<QueueEntry> = load_json(storage.as_ref(), QUEUE_KEY).await?.unwrap_or_default();
        if !entries.is_empty() {
            tracing::info!(entries = entries.len(), "Loaded offline queue");
        }
        Ok(Self {
            entries: Mutex::new(entries),
            storage,
            persist_lock: tokio::sync::Mutex::new(()),
            max_retries: max_retries.max(1),
        })
    }

    pub async fn enqueue(&self, peer_id: &str, item: QueuedSend, now: u64) -> Result<QueueEntry> {
        let entry = QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            item,
            retry_count: 0,
            last_retry: None,
            status: QueueStatus::Pending,
            created_at: now,
            last_error: None,
        };
        lock(&self.entries).push(entry.clone());
        if let Err(e) = self.persist().await {
            // Not durable, so not queued
            lock(&self.entries).retain(|queued| queued.id != entry.id);
            return Err(e);
        }
        tracing::debug!(peer_id, entry_id = %entry.id, kind = ?entry.item.kind(), "Queued for offline delivery");
        Ok(entry)
    }

    /// Pending entries for one peer, oldest first.
    pub fn pending_for(&self, peer_id: &str) -> Vec<QueueEntry> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.peer_id == peer_id && e.status == QueueStatus::Pending)
            .cloned()
            .collect()
    }

    /// Peers with at least one pending entry.
    pub fn pending_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = lock(&self.entries)
            .iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .map(|e| e.peer_id.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Count a failed delivery attempt. Returns the entry once it has reached
    /// the ceiling and been marked failed.
    pub async fn record_failure(&self, entry_id: &str, error: &str, now: u64) -> Result<Option<QueueEntry>> {
        let failed = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.iter_mut().find(|e| e.id == entry_id && e.status == QueueStatus::Pending) else {
                return Ok(None);
            };
            entry.retry_count += 1;
            entry.last_retry = Some(now);
            entry.last_error = Some(error.to_string());
            if entry.retry_count >= self.max_retries {
                entry.status = QueueStatus::Failed;
                Some(entry.clone())
            } else {
                None
            }
        };
        if let Some(entry) = &failed {
            tracing::warn!(entry_id, peer_id = %entry.peer_id, retries = entry.retry_count, "Queue entry failed permanently");
        }
        self.persist().await?;
        Ok(failed)
    }

    pub async fn mark_delivered(&self, entry_id: &str) -> Result<bool> {
        let removed = {
            let mut entries = lock(&self.entries);
            let before = entries.len();
            entries.retain(|e| e.id != entry_id);
            entries.len() != before
        };
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Delete every failed entry. Returns how many were dropped.
    pub async fn purge_failed(&self) -> Result<usize> {
        let purged = {
            let mut entries = lock(&self.entries);
            let before = entries.len();
            entries.retain(|e| e.status != QueueStatus::Failed);
            before - entries.len()
        };
        if purged > 0 {
            self.persist().await?;
        }
        Ok(purged)
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        lock(&self.entries).clone()
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.entries();
        store_json(self.storage.as_ref(), QUEUE_KEY, &snapshot).await
    }
}
