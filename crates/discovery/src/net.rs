use std::io::Error;
use std::net::{IpAddr, Ipv4Addr};
use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            // ip() returns std::net::IpAddr
            let family = if ip.is_ipv4() {"ipv4"} else {"ipv6"};
            let is_loopback = ip.is_loopback();
            let broadcast = match &ifa.addr {
                if_addrs::IfAddr::V4(v4) => v4.broadcast,
                if_addrs::IfAddr::V6(_) => None,
            };

            InterfaceIp {
                name: ifa.name,
                ip,
                family,
                is_loopback,
                broadcast,
            }
        }).collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Non-loopback IPv4 addresses of this host.
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = list_interface_ips_result()
        .unwrap_or_default()
        .into_iter()
        .filter(|i| !i.is_loopback)
        .filter_map(|i| match i.ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Broadcast targets: the limited broadcast address plus every interface's
/// directed broadcast address.
pub fn broadcast_targets() -> Vec<Ipv4Addr> {
    let mut out = vec![Ipv4Addr::BROADCAST];
    for iface in list_interface_ips_result().unwrap_or_default() {
        if let Some(b) = iface.broadcast {
            if !iface.is_loopback && !out.contains(&b) {
                out.push(b);
            }
        }
    }
    out
}

/// Every other host address in `ip`'s /24.
pub fn subnet_hosts(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, own] = ip.octets();
    (1..=254u8)
        .filter(|&d| d != own)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .collect()
}

/// True for addresses that belong to this host.
pub fn is_local_address(ip: IpAddr) -> bool {
    ip.is_loopback()
        || list_interface_ips_result()
            .map(|ifs| ifs.iter().any(|i| i.ip == ip))
            .unwrap_or(false)
}
