use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::{DiscoveryMethod, DiscoveryPayload};
use crate::udp::{self, Reporter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Join the multicast group and announce periodically until cancelled.
pub async fn run(
    cfg: Arc<DiscoveryConfig>,
    payload: DiscoveryPayload,
    reporter: Reporter,
    token: CancellationToken,
) -> Result<(), DiscoveryError> {
    let group = cfg.multicast_group;
    let listener = udp::bind(cfg.multicast_port, false).await?;
    listener
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .map_err(DiscoveryError::Multicast)?;
    tracing::info!(%group, port = cfg.multicast_port, "Joined multicast group");

    let listen_task = tokio::spawn(udp::recv_loop(
        Arc::new(listener),
        reporter,
        DiscoveryMethod::Multicast,
        None,
        token.clone(),
    ));

    let sender = udp::bind(0, false).await?;
    sender.set_multicast_ttl_v4(1)?;
    let to = SocketAddr::V4(SocketAddrV4::new(group, cfg.multicast_port));
    let bytes = payload.encode();
    let mut ticker = tokio::time::interval(cfg.announce_interval());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sender.send_to(&bytes, to).await {
                    tracing::trace!(%to, error = %e, "Multicast send failed");
                }
            }
        }
    }

    let _ = listen_task.await;
    tracing::debug!("Multicast discovery stopped");
    Ok(())
}
