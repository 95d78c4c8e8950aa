//! UDP hole-punch responders and probes.
//!
//! Responders answer any discovery payload with their own. A probe is sent from
//! an ephemeral socket to every punch port of a candidate, which opens a NAT
//! mapping towards it and collects whatever answers within the wait window.

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::{DiscoveryMethod, DiscoveryPayload, Sighting};
use crate::udp::{self, Reporter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub async fn run_responders(
    cfg: Arc<DiscoveryConfig>,
    payload: DiscoveryPayload,
    reporter: Reporter,
    token: CancellationToken,
) -> Result<(), DiscoveryError> {
    let reply = payload.encode();
    let mut responders = JoinSet::new();
    for &port in &cfg.punch_ports {
        match udp::bind(port, false).await {
            Ok(socket) => {
                tracing::info!(port, "Hole-punch responder bound");
                responders.spawn(udp::recv_loop(
                    Arc::new(socket),
                    reporter.clone(),
                    DiscoveryMethod::HolePunch,
                    Some(reply.clone()),
                    token.clone(),
                ));
            }
            Err(e) => tracing::debug!(error = %e, "Punch port unavailable"),
        }
    }
    if responders.is_empty() {
        return Err(DiscoveryError::NoPorts(cfg.punch_ports.clone()));
    }
    while responders.join_next().await.is_some() {}
    tracing::debug!("Hole-punch responders stopped");
    Ok(())
}

/// Probe `target`'s punch ports and report every peer that answers within `wait`.
pub async fn punch(
    ports: &[u16],
    target: IpAddr,
    payload: &DiscoveryPayload,
    reporter: &Reporter,
    wait: Duration,
) -> Result<Vec<Sighting>, DiscoveryError> {
    let socket = udp::bind(0, false).await?;
    let bytes = payload.encode();
    for &port in ports {
        let to = SocketAddr::new(target, port);
        if let Err(e) = socket.send_to(&bytes, to).await {
            tracing::trace!(%to, error = %e, "Punch probe failed");
        }
    }

    let mut found = Vec::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let Ok((len, from)) = received else { continue };
        if let Some(p) = DiscoveryPayload::decode(&buf[..len]) {
            if let Some(s) = reporter.report(p, from, DiscoveryMethod::HolePunch) {
                found.push(s);
            }
        }
    }
    Ok(found)
}
