use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Annotation prefix selecting how a named container interface is handed to the guest
pub const INTERFACE_MODE_ANNOTATION_PREFIX: &str = "fcspawn.io/interface/";

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut octets = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            bail!("invalid MAC address: {}", s);
        }
        for (octet, part) in octets.iter_mut().zip(parts) {
            *octet = u8::from_str_radix(part, 16)
                .with_context(|| format!("invalid MAC address: {}", s))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// IPv4 address with prefix length (e.g. 10.0.0.5/24)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> anyhow::Result<Self> {
        if prefix_len > 32 {
            bail!("invalid IPv4 prefix length: {}", prefix_len);
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn mask(&self) -> Ipv4Addr {
        let bits = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        };
        Ipv4Addr::from(bits)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.mask()))
    }
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Net {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("missing prefix length: {}", s))?;
        let addr: Ipv4Addr = addr.parse().with_context(|| format!("invalid address: {}", s))?;
        let prefix: u8 = prefix.parse().with_context(|| format!("invalid prefix: {}", s))?;
        Self::new(addr, prefix)
    }
}

/// How a container interface is handed to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceMode {
    /// Address taken over and served back to the guest via DHCP through a bridge
    #[default]
    DhcpBridge,
    /// Traffic mirrored between the interface and a tap, no DHCP
    TcRedirect,
}

impl FromStr for InterfaceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "dhcp-bridge" => Ok(Self::DhcpBridge),
            "tc-redirect" => Ok(Self::TcRedirect),
            _ => bail!("unknown interface mode: {}", s),
        }
    }
}

/// Extract `interface name -> mode` from VM annotations.
/// Unknown mode values are reported and skipped.
pub fn interface_modes(annotations: &BTreeMap<String, String>) -> BTreeMap<String, InterfaceMode> {
    annotations
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(INTERFACE_MODE_ANNOTATION_PREFIX)?;
            match value.parse() {
                Ok(mode) => Some((name.to_string(), mode)),
                Err(e) => {
                    tracing::warn!(interface = %name, "ignoring annotation: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Lease descriptor: a stolen container address bound to the guest NIC that
/// will receive it. Process-local, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Container interface the address was taken from
    pub interface: String,
    /// Bridge joining the container interface and the tap
    pub bridge: String,
    /// Host tap device the guest NIC is attached to
    pub tap: String,
    pub ip: Ipv4Net,
    /// None means the guest gets no default route
    pub gateway: Option<Ipv4Addr>,
    /// Only DHCP clients with this hardware address are answered
    pub mac: MacAddr,
    pub dns: Vec<Ipv4Addr>,
    pub dns6: Vec<Ipv6Addr>,
}

/// Interface passed to the guest without DHCP service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughNic {
    pub interface: String,
    pub tap: String,
    pub mac: MacAddr,
}

/// A virtual NIC as the hypervisor sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNic {
    pub tap: String,
    pub mac: MacAddr,
}

/// Result of network provisioning
#[derive(Debug, Clone, Default)]
pub struct NetworkSetup {
    pub leases: Vec<Lease>,
    pub passthrough: Vec<PassthroughNic>,
}

impl NetworkSetup {
    /// Guest NICs in attach order: leased interfaces first, then pass-through
    pub fn guest_nics(&self) -> Vec<GuestNic> {
        self.leases
            .iter()
            .map(|l| GuestNic {
                tap: l.tap.clone(),
                mac: l.mac,
            })
            .chain(self.passthrough.iter().map(|p| GuestNic {
                tap: p.tap.clone(),
                mac: p.mac,
            }))
            .collect()
    }

    pub fn ip_addresses(&self) -> Vec<Ipv4Addr> {
        self.leases.iter().map(|l| l.ip.addr).collect()
    }
}

/// Tap device name for a container interface (kernel limit is 15 chars)
pub fn tap_name(interface: &str) -> String {
    truncate_ifname(format!("vm_{}", interface))
}

/// Bridge name for a container interface
pub fn bridge_name(interface: &str) -> String {
    truncate_ifname(format!("br_{}", interface))
}

fn truncate_ifname(mut name: String) -> String {
    name.truncate(15);
    name
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub guest_port: u16,
    pub proto: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl PortMapping {
    /// Parse port mapping from string: [HOSTIP:]HOSTPORT:GUESTPORT[/PROTO]
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();

        let (host_ip, host_port_str, guest_port_str) = match parts.len() {
            2 => (None, parts[0], parts[1]),
            3 => (Some(parts[0].to_string()), parts[1], parts[2]),
            _ => bail!("invalid port mapping format: {}", s),
        };

        let (guest_port_str, proto) = match guest_port_str.split_once('/') {
            Some((port, "tcp")) => (port, Protocol::Tcp),
            Some((port, "udp")) => (port, Protocol::Udp),
            Some((_, other)) => bail!("invalid protocol: {}", other),
            None => (guest_port_str, Protocol::Tcp),
        };

        let host_port = host_port_str
            .parse()
            .map_err(|_| anyhow!("invalid host port: {}", host_port_str))?;
        let guest_port = guest_port_str
            .parse()
            .map_err(|_| anyhow!("invalid guest port: {}", guest_port_str))?;

        Ok(Self {
            host_ip,
            host_port,
            guest_port,
            proto,
        })
    }
}

/// Generate a random locally administered unicast MAC address
pub fn generate_mac() -> MacAddr {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    let mut octets: [u8; 6] = rng.gen();
    octets[0] = 0x02;
    MacAddr(octets)
}
