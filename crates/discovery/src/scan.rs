//! Local-subnet TCP scan, the last-resort strategy.
//!
//! Every host of each local /24 is probed on the known TCP ports. An open port
//! only counts as a peer if it answers our discovery frame with its own.

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::{DiscoveryMethod, DiscoveryPayload, Sighting};
use crate::net::{local_ipv4_addrs, subnet_hosts};
use crate::udp::Reporter;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use transport_tcp::{connect_timeout, read_frame, write_json};

/// Confirm that `addr` is a peer: send our payload, expect one back.
pub async fn probe(addr: SocketAddr, payload: &DiscoveryPayload, timeout: Duration) -> Option<DiscoveryPayload> {
    let mut stream = connect_timeout(addr, timeout).await.ok()?;
    let exchange = async {
        write_json(&mut stream, &payload.to_json()).await.ok()?;
        let bytes = read_frame(&mut stream).await.ok()?;
        DiscoveryPayload::decode(&bytes)
    };
    tokio::time::timeout(timeout * 2, exchange).await.ok().flatten()
}

/// Scan `hosts` × `ports` with at most `concurrency` probes in flight.
pub async fn scan_hosts(
    hosts: Vec<IpAddr>,
    ports: &[u16],
    payload: &DiscoveryPayload,
    reporter: &Reporter,
    concurrency: usize,
    timeout: Duration,
    token: &CancellationToken,
) -> Vec<Sighting> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut probes = JoinSet::new();
    for host in hosts {
        for &port in ports {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if token.is_cancelled() {
                break;
            }
            let payload = payload.clone();
            let addr = SocketAddr::new(host, port);
            probes.spawn(async move {
                let found = probe(addr, &payload, timeout).await;
                drop(permit);
                found.map(|p| (p, addr))
            });
        }
    }

    let mut found = Vec::new();
    while let Some(res) = probes.join_next().await {
        if let Ok(Some((p, addr))) = res {
            if let Some(s) = reporter.report(p, addr, DiscoveryMethod::SubnetScan) {
                found.push(s);
            }
        }
    }
    found
}

/// Rescan the local subnets every `scan_interval` until cancelled.
pub async fn run(
    cfg: Arc<DiscoveryConfig>,
    payload: DiscoveryPayload,
    reporter: Reporter,
    token: CancellationToken,
) -> Result<(), DiscoveryError> {
    let mut ticker = tokio::time::interval(cfg.scan_interval());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let hosts: Vec<IpAddr> = local_ipv4_addrs()
                    .into_iter()
                    .flat_map(subnet_hosts)
                    .map(IpAddr::V4)
                    .collect();
                tracing::debug!(hosts = hosts.len(), "Starting subnet scan");
                let found = scan_hosts(
                    hosts,
                    &cfg.scan_ports,
                    &payload,
                    &reporter,
                    cfg.scan_concurrency,
                    cfg.scan_connect_timeout(),
                    &token,
                )
                .await;
                tracing::debug!(peers = found.len(), "Subnet scan finished");
            }
        }
    }
    tracing::debug!("Subnet scan stopped");
    Ok(())
}
