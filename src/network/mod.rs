pub mod dhcp;
pub mod link;
pub mod takeover;
pub mod types;

pub use link::{IpCommand, LinkInfo, LinkOps};
pub use takeover::{discover, take_over, Candidate, DiscoveryOptions};
pub use types::*;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Upstream resolvers when the local one is systemd-resolved's stub
const SYSTEMD_RESOLV_CONF: &str = "/run/systemd/resolve/resolv.conf";

/// Nameservers from resolv.conf content, in file order
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix("nameserver")
                .and_then(|s| s.trim().parse().ok())
        })
        .collect()
}

/// Read the DNS servers the guest should use, split by family.
///
/// Loopback resolvers are useless to the guest. If only loopback IPv4
/// servers are configured (systemd-resolved stub), falls back to the real
/// upstream list.
pub fn read_dns_servers(resolv_conf: &Path) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let content = std::fs::read_to_string(resolv_conf).unwrap_or_default();
    let mut servers = parse_nameservers(&content);

    if servers.iter().all(|s| s.is_loopback()) {
        if let Ok(real) = std::fs::read_to_string(SYSTEMD_RESOLV_CONF) {
            let real_servers = parse_nameservers(&real);
            if !real_servers.is_empty() {
                servers = real_servers;
            }
        }
    }

    split_by_family(&servers)
}

fn split_by_family(servers: &[IpAddr]) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for server in servers.iter().filter(|s| !s.is_loopback()) {
        match server {
            IpAddr::V4(a) => v4.push(*a),
            IpAddr::V6(a) => v6.push(*a),
        }
    }
    (v4, v6)
}
