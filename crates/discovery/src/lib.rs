//! Serverless peer discovery.
//!
//! Four independent strategies run side by side: UDP broadcast, IP multicast,
//! UDP hole-punch responders and a local-subnet TCP scan. They all announce the
//! same cleartext [`DiscoveryPayload`] and feed [`Sighting`]s into one channel.
//! A strategy that cannot start is logged and skipped.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod holepunch;
pub mod model;
pub mod multicast;
pub mod net;
pub mod scan;
pub mod udp;

pub use config::DiscoveryConfig;
pub use error::DiscoveryError;
pub use model::{DiscoveryMethod, DiscoveryPayload, Sighting};
pub use udp::Reporter;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SIGHTING_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct DiscoveryEngine {
    cfg: Arc<DiscoveryConfig>,
    payload: DiscoveryPayload,
    reporter: Reporter,
}

impl DiscoveryEngine {
    /// `tcp_port` is the port announced for inbound connections.
    pub fn new(cfg: DiscoveryConfig, self_id: &str, tcp_port: u16) -> (Self, mpsc::Receiver<Sighting>) {
        let (tx, rx) = mpsc::channel(SIGHTING_CHANNEL_CAPACITY);
        let engine = Self {
            cfg: Arc::new(cfg),
            payload: DiscoveryPayload::new(self_id, tcp_port),
            reporter: Reporter::new(self_id, tx),
        };
        (engine, rx)
    }

    pub fn payload(&self) -> &DiscoveryPayload {
        &self.payload
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Start every enabled strategy. Each loop exits when `token` is cancelled.
    pub fn spawn(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.cfg.broadcast_enabled {
            handles.push(self.spawn_strategy("broadcast", token, broadcast::run));
        }
        if self.cfg.multicast_enabled {
            handles.push(self.spawn_strategy("multicast", token, multicast::run));
        }
        if self.cfg.hole_punch_enabled {
            handles.push(self.spawn_strategy("hole_punch", token, holepunch::run_responders));
        }
        if self.cfg.subnet_scan_enabled {
            handles.push(self.spawn_strategy("subnet_scan", token, scan::run));
        }
        tracing::info!(strategies = handles.len(), peer_id = %self.payload.peer_id, "Discovery started");
        handles
    }

    fn spawn_strategy<F, Fut>(&self, name: &'static str, token: &CancellationToken, run: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<DiscoveryConfig>, DiscoveryPayload, Reporter, CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), DiscoveryError>> + Send + 'static,
    {
        let fut = run(self.cfg.clone(), self.payload.clone(), self.reporter.clone(), token.clone());
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!(strategy = name, error = %e, "Discovery strategy unavailable, skipping");
            }
        })
    }

    /// One-shot hole-punch towards `target`.
    pub async fn punch(&self, target: IpAddr, wait: Duration) -> Vec<Sighting> {
        match holepunch::punch(&self.cfg.punch_ports, target, &self.payload, &self.reporter, wait).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(%target, error = %e, "Hole punch failed");
                Vec::new()
            }
        }
    }

    /// Confirm a single address the way the subnet scan does.
    pub async fn probe(&self, addr: SocketAddr) -> Option<Sighting> {
        let payload = scan::probe(addr, &self.payload, self.cfg.scan_connect_timeout().max(Duration::from_secs(1))).await?;
        self.reporter.report(payload, addr, DiscoveryMethod::Manual)
    }
}
