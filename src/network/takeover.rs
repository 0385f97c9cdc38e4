//! Takeover networking: discover the container's interfaces, strip their
//! addresses and hand each one to the guest.
//!
//! Discovery only reads. It polls until at least one usable interface exists
//! (and every annotated interface has shown up), or gives up after the
//! configured timeout. Only then does takeover mutate anything.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::link::{LinkInfo, LinkOps};
use super::types::{
    bridge_name, generate_mac, tap_name, InterfaceMode, Ipv4Net, Lease, MacAddr, NetworkSetup,
    PassthroughNic,
};

/// A discovered interface that can be handed to the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Dhcp {
        interface: String,
        mac: MacAddr,
        ip: Ipv4Net,
        gateway: Option<Ipv4Addr>,
    },
    Passthrough {
        interface: String,
        mac: MacAddr,
    },
}

impl Candidate {
    pub fn interface(&self) -> &str {
        match self {
            Candidate::Dhcp { interface, .. } | Candidate::Passthrough { interface, .. } => {
                interface
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub modes: BTreeMap<String, InterfaceMode>,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Devices we create ourselves; never taken over again on re-entry
fn is_own_device(name: &str) -> bool {
    name.starts_with("vm_") || name.starts_with("br_")
}

/// One discovery pass. Interfaces that can't be used are skipped with a warning.
async fn discover_once(
    ops: &dyn LinkOps,
    modes: &BTreeMap<String, InterfaceMode>,
) -> Result<Vec<Candidate>> {
    let links = ops.list_links().await.context("listing interfaces")?;
    let mut candidates = Vec::new();

    for link in links {
        if link.loopback || is_own_device(&link.name) {
            continue;
        }
        match classify(ops, &link, modes.get(&link.name).copied().unwrap_or_default()).await {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => warn!(interface = %link.name, "skipping interface: {:#}", e),
        }
    }

    Ok(candidates)
}

async fn classify(ops: &dyn LinkOps, link: &LinkInfo, mode: InterfaceMode) -> Result<Candidate> {
    let Some(mac) = link.mac else {
        bail!("no hardware address");
    };

    match mode {
        InterfaceMode::TcRedirect => Ok(Candidate::Passthrough {
            interface: link.name.clone(),
            mac,
        }),
        InterfaceMode::DhcpBridge => {
            let Some(&ip) = link.addresses.first() else {
                bail!("no IPv4 address");
            };
            if link.addresses.len() > 1 {
                warn!(interface = %link.name, using = %ip, "interface has several IPv4 addresses, taking the first");
            }
            let gateway = ops
                .default_gateway(&link.name)
                .await
                .context("reading default route")?;
            Ok(Candidate::Dhcp {
                interface: link.name.clone(),
                mac,
                ip,
                gateway,
            })
        }
    }
}

fn is_complete(candidates: &[Candidate], modes: &BTreeMap<String, InterfaceMode>) -> bool {
    !candidates.is_empty()
        && modes
            .keys()
            .all(|name| candidates.iter().any(|c| c.interface() == name))
}

/// Poll until usable interfaces appear.
///
/// Container networking may still be converging when we start, so an empty
/// result is retried every `poll_interval` until `timeout` elapses.
pub async fn discover(ops: &dyn LinkOps, opts: &DiscoveryOptions) -> Result<Vec<Candidate>> {
    let deadline = Instant::now() + opts.timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match discover_once(ops, &opts.modes).await {
            Ok(candidates) if is_complete(&candidates, &opts.modes) => {
                info!(attempt, count = candidates.len(), "discovered container interfaces");
                return Ok(candidates);
            }
            Ok(candidates) => {
                debug!(attempt, found = candidates.len(), "interfaces not ready yet");
            }
            Err(e) => {
                debug!(attempt, "interface discovery failed: {:#}", e);
            }
        }

        if Instant::now() + opts.poll_interval > deadline {
            bail!(
                "timed out after {:?} waiting for usable network interfaces",
                opts.timeout
            );
        }
        tokio::time::sleep(opts.poll_interval).await;
    }
}

/// Strip addresses from the discovered interfaces and wire up guest taps.
pub async fn take_over(
    ops: &dyn LinkOps,
    candidates: Vec<Candidate>,
    dns: &[Ipv4Addr],
    dns6: &[Ipv6Addr],
) -> Result<NetworkSetup> {
    let mut setup = NetworkSetup::default();

    for candidate in candidates {
        match candidate {
            Candidate::Dhcp {
                interface,
                mac,
                ip,
                gateway,
            } => {
                let lease = bridge_interface(ops, &interface, mac, ip, gateway)
                    .await
                    .with_context(|| format!("taking over {}", interface))?;
                setup.leases.push(Lease {
                    dns: dns.to_vec(),
                    dns6: dns6.to_vec(),
                    ..lease
                });
            }
            Candidate::Passthrough { interface, mac } => {
                let nic = redirect_interface(ops, &interface, mac)
                    .await
                    .with_context(|| format!("redirecting {}", interface))?;
                setup.passthrough.push(nic);
            }
        }
    }

    Ok(setup)
}

async fn bridge_interface(
    ops: &dyn LinkOps,
    interface: &str,
    mac: MacAddr,
    ip: Ipv4Net,
    gateway: Option<Ipv4Addr>,
) -> Result<Lease> {
    let tap = tap_name(interface);
    let bridge = bridge_name(interface);

    ops.remove_address(interface, ip).await?;
    // The guest NIC takes over the original hardware address
    ops.set_mac(interface, generate_mac()).await?;
    ops.create_bridge(&bridge).await?;
    ops.create_tap(&tap).await?;
    ops.set_master(interface, &bridge).await?;
    ops.set_master(&tap, &bridge).await?;
    for dev in [bridge.as_str(), tap.as_str(), interface] {
        ops.set_up(dev).await?;
    }

    info!(
        interface = %interface,
        ip = %ip,
        gateway = ?gateway,
        mac = %mac,
        tap = %tap,
        "took over interface address"
    );

    Ok(Lease {
        interface: interface.to_string(),
        bridge,
        tap,
        ip,
        gateway,
        mac,
        dns: Vec::new(),
        dns6: Vec::new(),
    })
}

async fn redirect_interface(
    ops: &dyn LinkOps,
    interface: &str,
    mac: MacAddr,
) -> Result<PassthroughNic> {
    let tap = tap_name(interface);

    ops.create_tap(&tap).await?;
    ops.set_up(&tap).await?;
    ops.redirect_ingress(interface, &tap).await?;
    ops.redirect_ingress(&tap, interface).await?;

    info!(interface = %interface, tap = %tap, mac = %mac, "passing interface through");

    Ok(PassthroughNic {
        interface: interface.to_string(),
        tap,
        mac,
    })
}
