//! TeamLink Core - serverless LAN collaboration
//!
//! Peers find each other on the local network, open mutually authenticated
//! encrypted TCP connections, and exchange chat, presence, files and
//! replicated team data. [`Node`] wires the pieces together.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod liveness;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod queue;
pub mod sync;
pub mod transfer;

// Re-export commonly used types
pub use config::NodeConfig;
pub use error::{CoreError, Result};
pub use events::{DisconnectReason, NodeEvent};
pub use identity::{Identity, PeerId};
pub use node::{Delivery, Invitation, Node};
pub use protocol::{Message, SyncChange};
pub use queue::{QueueEntry, QueueStatus};
pub use sync::{TeamDataItem, TeamSummary};
pub use transfer::Transfer;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use storage::Storage;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Tables stay usable after a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) async fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    match storage.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) async fn store_json<T: Serialize + ?Sized>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, &bytes).await?;
    Ok(())
}
