//! Link-layer plumbing inside the sandbox container.
//!
//! All operations shell out to `ip` and `tc` (JSON output where we parse),
//! behind the [`LinkOps`] seam so discovery and takeover logic can be driven
//! by a fake in tests.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::debug;

use super::types::{Ipv4Net, MacAddr};

/// A container network interface as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub loopback: bool,
    pub addresses: Vec<Ipv4Net>,
}

#[async_trait::async_trait]
pub trait LinkOps: Send + Sync {
    /// All interfaces with their IPv4 addresses
    async fn list_links(&self) -> Result<Vec<LinkInfo>>;

    /// Default-route gateway via `dev`, if any
    async fn default_gateway(&self, dev: &str) -> Result<Option<Ipv4Addr>>;

    async fn remove_address(&self, dev: &str, addr: Ipv4Net) -> Result<()>;

    async fn set_mac(&self, dev: &str, mac: MacAddr) -> Result<()>;

    async fn create_tap(&self, name: &str) -> Result<()>;

    async fn create_bridge(&self, name: &str) -> Result<()>;

    async fn set_master(&self, dev: &str, master: &str) -> Result<()>;

    async fn set_up(&self, dev: &str) -> Result<()>;

    /// Mirror every frame arriving on `from` out of `to`
    async fn redirect_ingress(&self, from: &str, to: &str) -> Result<()>;
}

/// [`LinkOps`] backed by iproute2
#[derive(Debug, Clone, Default)]
pub struct IpCommand;

async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!(target: "link", "{} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("executing {} {}", program, args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
}

/// Parse `ip -j addr show`
pub fn parse_links(json: &str) -> Result<Vec<LinkInfo>> {
    let links: Vec<IpLink> = serde_json::from_str(json).context("parsing ip addr output")?;

    Ok(links
        .into_iter()
        .map(|link| {
            let loopback = link.link_type.as_deref() == Some("loopback");
            let mac = if loopback {
                None
            } else {
                link.address.as_deref().and_then(|a| a.parse().ok())
            };
            let addresses = link
                .addr_info
                .iter()
                .filter(|info| info.family == "inet")
                .filter_map(|info| {
                    let addr: Ipv4Addr = info.local.as_deref()?.parse().ok()?;
                    Ipv4Net::new(addr, info.prefixlen?).ok()
                })
                .collect();
            LinkInfo {
                name: link.ifname,
                mac,
                loopback,
                addresses,
            }
        })
        .collect())
}

/// Pick the default-route gateway for `dev` out of `ip -j -4 route show default`
pub fn parse_default_gateway(json: &str, dev: &str) -> Result<Option<Ipv4Addr>> {
    let routes: Vec<IpRoute> = serde_json::from_str(json).context("parsing ip route output")?;

    for route in routes {
        if route.dst.as_deref() != Some("default") || route.dev.as_deref() != Some(dev) {
            continue;
        }
        if let Some(gw) = route.gateway {
            let gw = gw
                .parse()
                .with_context(|| format!("invalid gateway address: {}", gw))?;
            return Ok(Some(gw));
        }
    }

    Ok(None)
}

#[async_trait::async_trait]
impl LinkOps for IpCommand {
    async fn list_links(&self) -> Result<Vec<LinkInfo>> {
        let out = run("ip", &["-j", "addr", "show"]).await?;
        parse_links(&out)
    }

    async fn default_gateway(&self, dev: &str) -> Result<Option<Ipv4Addr>> {
        let out = run("ip", &["-j", "-4", "route", "show", "default"]).await?;
        parse_default_gateway(&out, dev)
    }

    async fn remove_address(&self, dev: &str, addr: Ipv4Net) -> Result<()> {
        run("ip", &["addr", "del", &addr.to_string(), "dev", dev]).await?;
        Ok(())
    }

    async fn set_mac(&self, dev: &str, mac: MacAddr) -> Result<()> {
        run("ip", &["link", "set", "dev", dev, "address", &mac.to_string()]).await?;
        Ok(())
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        run("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).await?;
        Ok(())
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        run("ip", &["link", "add", "name", name, "type", "bridge"]).await?;
        Ok(())
    }

    async fn set_master(&self, dev: &str, master: &str) -> Result<()> {
        run("ip", &["link", "set", "dev", dev, "master", master]).await?;
        Ok(())
    }

    async fn set_up(&self, dev: &str) -> Result<()> {
        run("ip", &["link", "set", "dev", dev, "up"]).await?;
        Ok(())
    }

    async fn redirect_ingress(&self, from: &str, to: &str) -> Result<()> {
        run("tc", &["qdisc", "add", "dev", from, "ingress"]).await?;
        run(
            "tc",
            &[
                "filter", "add", "dev", from, "parent", "ffff:", "protocol", "all", "u32", "match",
                "u8", "0", "0", "action", "mirred", "egress", "redirect", "dev", to,
            ],
        )
        .await?;
        Ok(())
    }
}
