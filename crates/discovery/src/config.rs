use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub broadcast_enabled: bool,
    pub multicast_enabled: bool,
    pub hole_punch_enabled: bool,
    pub subnet_scan_enabled: bool,

    /// UDP ports used for broadcast announcements; each instance listens on
    /// every one it can bind and announces to all of them.
    pub broadcast_ports: Vec<u16>,

    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,

    /// UDP ports answering hole-punch probes
    pub punch_ports: Vec<u16>,

    /// TCP ports probed by the subnet scan (normally the node's candidate ports)
    pub scan_ports: Vec<u16>,

    pub announce_interval_ms: u64,
    pub scan_interval_ms: u64,
    pub scan_connect_timeout_ms: u64,
    pub scan_concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_enabled: true,
            multicast_enabled: true,
            hole_punch_enabled: true,
            subnet_scan_enabled: true,
            broadcast_ports: vec![37020, 37021, 37022],
            multicast_group: Ipv4Addr::new(239, 255, 42, 99),
            multicast_port: 37030,
            punch_ports: vec![37040, 37041],
            scan_ports: vec![37050, 37051, 37052, 37053, 37054],
            announce_interval_ms: 5_000,
            scan_interval_ms: 120_000,
            scan_connect_timeout_ms: 300,
            scan_concurrency: 32,
        }
    }
}

impl DiscoveryConfig {
    /// All strategies off; peers must be added by hand.
    pub fn disabled() -> Self {
        Self {
            broadcast_enabled: false,
            multicast_enabled: false,
            hole_punch_enabled: false,
            subnet_scan_enabled: false,
            ..Self::default()
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn scan_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_connect_timeout_ms)
    }
}
