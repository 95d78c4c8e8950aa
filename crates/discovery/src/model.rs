use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// The announcement every strategy sends, in cleartext:
/// `{"type":"discovery","peer_id":...,"preferred_tcp_port":...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPayload {
    pub peer_id: String,
    pub preferred_tcp_port: u16,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Packet {
    Discovery { peer_id: String, preferred_tcp_port: u16 },
}

impl DiscoveryPayload {
    pub fn new(peer_id: impl Into<String>, preferred_tcp_port: u16) -> Self {
        Self { peer_id: peer_id.into(), preferred_tcp_port }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Serializing a plain enum of strings and ints cannot fail
        serde_json::to_value(Packet::Discovery {
            peer_id: self.peer_id.clone(),
            preferred_tcp_port: self.preferred_tcp_port,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    /// Decode a datagram. Anything that is not a well-formed discovery payload is `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Packet>(bytes) {
            Ok(Packet::Discovery { peer_id, preferred_tcp_port }) if !peer_id.is_empty() => {
                Some(Self { peer_id, preferred_tcp_port })
            }
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match Packet::deserialize(value) {
            Ok(Packet::Discovery { peer_id, preferred_tcp_port }) if !peer_id.is_empty() => {
                Some(Self { peer_id, preferred_tcp_port })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Broadcast,
    Multicast,
    HolePunch,
    SubnetScan,
    Manual,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiscoveryMethod::Broadcast => "broadcast",
            DiscoveryMethod::Multicast => "multicast",
            DiscoveryMethod::HolePunch => "hole_punch",
            DiscoveryMethod::SubnetScan => "subnet_scan",
            DiscoveryMethod::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A peer seen by one of the strategies. The address is where the packet came
/// from; the port is the TCP port the peer asked to be dialled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub peer_id: String,
    pub address: IpAddr,
    pub port: u16,
    pub method: DiscoveryMethod,
}

impl Sighting {
    pub fn from_payload(payload: DiscoveryPayload, from: SocketAddr, method: DiscoveryMethod) -> Self {
        Self {
            peer_id: payload.peer_id,
            address: from.ip(),
            port: payload.preferred_tcp_port,
            method,
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str,  //ipv4 or ipv6
    pub is_loopback: bool,
    /// Directed broadcast address, IPv4 only.
    pub broadcast: Option<std::net::Ipv4Addr>,
}
