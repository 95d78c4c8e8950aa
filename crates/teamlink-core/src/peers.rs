//! Known peers, as seen by discovery or added by hand.

use crate::error::Result;
use crate::identity::PeerId;
use crate::{load_json, lock, store_json};
use discovery::{DiscoveryMethod, Sighting};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use storage::Storage;

const PEERS_KEY: &str = "peers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub network_address: IpAddr,
    /// TCP port the peer listens on
    pub port: u16,
    pub discovery_method: DiscoveryMethod,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.network_address, self.port)
    }
}

/// Peer id -> record. Records are only removed explicitly.
pub struct PeerTable {
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
    storage: Arc<dyn Storage>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl PeerTable {
    /// Load the persisted table, starting empty if nothing was stored.
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let records: Vec<PeerRecord> = load_json(storage.as_ref(), PEERS_KEY).await?.unwrap_or_default();
        let peers = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(Self { peers: Mutex::new(peers), storage, persist_lock: tokio::sync::Mutex::new(()) })
    }

    /// Record a sighting. Returns the updated record and whether the peer is new.
    pub fn upsert(&self, sighting: &Sighting, now: u64) -> (PeerRecord, bool) {
        let mut peers = lock(&self.peers);
        match peers.get_mut(&sighting.peer_id) {
            Some(record) => {
                record.network_address = sighting.address;
                record.port = sighting.port;
                record.discovery_method = sighting.method;
                record.last_seen = now;
                (record.clone(), false)
            }
            None => {
                let record = PeerRecord {
                    id: sighting.peer_id.clone(),
                    network_address: sighting.address,
                    port: sighting.port,
                    discovery_method: sighting.method,
                    first_seen: now,
                    last_seen: now,
                };
                peers.insert(record.id.clone(), record.clone());
                (record, true)
            }
        }
    }

    /// Add or overwrite a manually configured peer.
    pub fn add_manual(&self, peer_id: &str, addr: SocketAddr, now: u64) -> PeerRecord {
        let sighting = Sighting {
            peer_id: peer_id.to_string(),
            address: addr.ip(),
            port: addr.port(),
            method: DiscoveryMethod::Manual,
        };
        self.upsert(&sighting, now).0
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        lock(&self.peers).remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        lock(&self.peers).get(peer_id).cloned()
    }

    pub fn is_known(&self, peer_id: &str) -> bool {
        lock(&self.peers).contains_key(peer_id)
    }

    /// Refresh `last_seen`, e.g. after a completed handshake.
    pub fn touch(&self, peer_id: &str, now: u64) {
        if let Some(record) = lock(&self.peers).get_mut(peer_id) {
            record.last_seen = now;
        }
    }

    /// All records, sorted by id.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut out: Vec<_> = lock(&self.peers).values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Write the current table. Concurrent calls are serialised, so the last
    /// write carries the newest snapshot.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let records = self.list();
        store_json(self.storage.as_ref(), PEERS_KEY, &records).await
    }
}
