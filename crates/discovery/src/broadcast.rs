use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::{DiscoveryMethod, DiscoveryPayload};
use crate::net::broadcast_targets;
use crate::udp::{self, Reporter};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Listen on every free broadcast port and announce to all of them until cancelled.
pub async fn run(
    cfg: Arc<DiscoveryConfig>,
    payload: DiscoveryPayload,
    reporter: Reporter,
    token: CancellationToken,
) -> Result<(), DiscoveryError> {
    let mut listeners = JoinSet::new();
    for &port in &cfg.broadcast_ports {
        match udp::bind(port, true).await {
            Ok(socket) => {
                tracing::info!(port, "Broadcast listener bound");
                listeners.spawn(udp::recv_loop(
                    Arc::new(socket),
                    reporter.clone(),
                    DiscoveryMethod::Broadcast,
                    None,
                    token.clone(),
                ));
            }
            Err(e) => tracing::debug!(error = %e, "Broadcast port in use, announcing only"),
        }
    }

    let sender = udp::bind(0, true).await?;
    let bytes = payload.encode();
    let mut ticker = tokio::time::interval(cfg.announce_interval());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                for target in broadcast_targets() {
                    for &port in &cfg.broadcast_ports {
                        let to = SocketAddr::V4(SocketAddrV4::new(target, port));
                        if let Err(e) = sender.send_to(&bytes, to).await {
                            tracing::trace!(%to, error = %e, "Broadcast send failed");
                        }
                    }
                }
            }
        }
    }

    while listeners.join_next().await.is_some() {}
    tracing::debug!("Broadcast discovery stopped");
    Ok(())
}
