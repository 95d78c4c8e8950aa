//! Shared UDP plumbing for the datagram-based strategies.

use crate::error::DiscoveryError;
use crate::model::{DiscoveryMethod, DiscoveryPayload, Sighting};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 2048;
const REPLY_COOLDOWN: Duration = Duration::from_secs(1);

/// Forwards accepted sightings upward. Our own announcements are dropped here,
/// whichever strategy heard them.
#[derive(Clone)]
pub struct Reporter {
    self_id: Arc<str>,
    tx: mpsc::Sender<Sighting>,
}

impl Reporter {
    pub fn new(self_id: &str, tx: mpsc::Sender<Sighting>) -> Self {
        Self { self_id: Arc::from(self_id), tx }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Returns the sighting if it was accepted (not ourselves).
    pub fn report(&self, payload: DiscoveryPayload, from: SocketAddr, method: DiscoveryMethod) -> Option<Sighting> {
        if payload.peer_id == *self.self_id {
            return None;
        }
        let sighting = Sighting::from_payload(payload, from, method);
        tracing::trace!(peer_id = %sighting.peer_id, %from, %method, "Peer sighted");
        if let Err(e) = self.tx.try_send(sighting.clone()) {
            tracing::debug!(error = %e, "Dropping sighting, consumer is behind or gone");
        }
        Some(sighting)
    }
}

pub async fn bind(port: u16, broadcast: bool) -> Result<UdpSocket, DiscoveryError> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|source| DiscoveryError::Bind { port, source })?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    Ok(socket)
}

/// Receive discovery payloads until cancelled. When `reply` is set, every
/// sender gets our own payload back (at most once per cooldown per address).
pub async fn recv_loop(
    socket: Arc<UdpSocket>,
    reporter: Reporter,
    method: DiscoveryMethod,
    reply: Option<Vec<u8>>,
    token: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut replied: HashMap<SocketAddr, Instant> = HashMap::new();
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let (len, from) = match received {
            Ok(v) => v,
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms; keep listening
                tracing::debug!(%method, error = %e, "UDP receive error");
                continue;
            }
        };
        let Some(payload) = DiscoveryPayload::decode(&buf[..len]) else {
            continue;
        };
        if reporter.report(payload, from, method).is_none() {
            continue;
        }
        if let Some(reply) = &reply {
            let now = Instant::now();
            let recent = replied.get(&from).is_some_and(|t| now.duration_since(*t) < REPLY_COOLDOWN);
            if !recent {
                replied.insert(from, now);
                replied.retain(|_, t| now.duration_since(*t) < REPLY_COOLDOWN);
                if let Err(e) = socket.send_to(reply, from).await {
                    tracing::debug!(%from, error = %e, "Failed to answer probe");
                }
            }
        }
    }
    tracing::debug!(%method, "UDP listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reporter_filters_self() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = Reporter::new("me", tx);
        let from: SocketAddr = "10.0.0.2:37020".parse().unwrap();

        assert!(reporter.report(DiscoveryPayload::new("me", 1), from, DiscoveryMethod::Broadcast).is_none());
        assert!(reporter.report(DiscoveryPayload::new("other", 37050), from, DiscoveryMethod::Broadcast).is_some());

        let s = rx.recv().await.unwrap();
        assert_eq!(s.peer_id, "other");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn listener_answers_probes_once_per_cooldown() {
        let (tx, mut rx) = mpsc::channel(8);
        let reporter = Reporter::new("responder", tx);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let token = CancellationToken::new();
        let reply = DiscoveryPayload::new("responder", 37050).encode();
        let task = tokio::spawn(recv_loop(socket, reporter, DiscoveryMethod::HolePunch, Some(reply), token.clone()));

        let prober = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe = DiscoveryPayload::new("prober", 37051).encode();
        prober.send_to(&probe, addr).await.unwrap();
        prober.send_to(&probe, addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), prober.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(DiscoveryPayload::decode(&buf[..n]).unwrap().peer_id, "responder");
        assert!(tokio::time::timeout(Duration::from_millis(200), prober.recv_from(&mut buf)).await.is_err());

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.peer_id, "prober");
        assert_eq!(seen.port, 37051);

        token.cancel();
        task.await.unwrap();
    }
}
