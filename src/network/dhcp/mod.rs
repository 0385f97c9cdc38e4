//! DHCP responders handing each guest the address its container interface
//! used to hold. One task per lease and protocol, bound to the lease's bridge.

pub mod v4;
pub mod v6;

use anyhow::{Context, Result};
use nix::sys::socket::{
    bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6,
};
use std::ffi::OsString;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{Lease, NetworkSetup};

fn udp_socket(family: AddressFamily, device: &str) -> Result<OwnedFd> {
    let fd = socket(family, SockType::Datagram, SockFlag::SOCK_NONBLOCK, None)
        .context("creating UDP socket")?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).context("setting SO_REUSEADDR")?;
    setsockopt(&fd, sockopt::BindToDevice, &OsString::from(device))
        .with_context(|| format!("binding socket to device {}", device))?;
    Ok(fd)
}

/// UDP socket on 0.0.0.0:`port` that only sees traffic from `device`
pub fn bind_udp_v4(device: &str, port: u16) -> Result<UdpSocket> {
    let fd = udp_socket(AddressFamily::Inet, device)?;
    setsockopt(&fd, sockopt::Broadcast, &true).context("setting SO_BROADCAST")?;
    let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    bind(fd.as_raw_fd(), &addr).with_context(|| format!("binding {} on {}", addr, device))?;

    UdpSocket::from_std(std::net::UdpSocket::from(fd)).context("registering socket with tokio")
}

/// UDP socket on [::]:`port` joined to the DHCPv6 server multicast group on `device`
pub fn bind_udp_v6(device: &str, port: u16) -> Result<UdpSocket> {
    let fd = udp_socket(AddressFamily::Inet6, device)?;
    setsockopt(&fd, sockopt::Ipv6V6Only, &true).context("setting IPV6_V6ONLY")?;
    let addr = SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
    bind(fd.as_raw_fd(), &addr).with_context(|| format!("binding {} on {}", addr, device))?;

    let index = nix::net::if_::if_nametoindex(device)
        .with_context(|| format!("looking up index of {}", device))?;
    let std_socket = std::net::UdpSocket::from(fd);
    std_socket
        .join_multicast_v6(&v6::ALL_SERVERS, index)
        .with_context(|| format!("joining {} on {}", v6::ALL_SERVERS, device))?;

    UdpSocket::from_std(std_socket).context("registering socket with tokio")
}

/// Answer DHCPv4 on the lease's bridge until the socket fails
pub async fn serve_v4(lease: Lease) -> Result<()> {
    let socket = bind_udp_v4(&lease.bridge, v4::SERVER_PORT)?;
    info!(
        target: "dhcp",
        bridge = %lease.bridge,
        ip = %lease.ip,
        "serving DHCPv4"
    );

    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await.context("receiving DHCPv4")?;
        let request = match v4::Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(target: "dhcp", %from, "ignoring malformed DHCPv4 packet: {:#}", e);
                continue;
            }
        };

        let Some(reply) = v4::respond(&lease, &request) else {
            continue;
        };
        let dest = v4::reply_destination(&request);
        debug!(
            target: "dhcp",
            %dest,
            kind = ?reply.message_type(),
            yiaddr = %reply.yiaddr,
            "sending DHCPv4 reply"
        );
        if let Err(e) = socket.send_to(&reply.encode(), SocketAddr::V4(dest)).await {
            warn!(target: "dhcp", %dest, "failed to send DHCPv4 reply: {}", e);
        }
    }
}

/// Answer DHCPv6 on the lease's bridge until the socket fails
pub async fn serve_v6(lease: Lease) -> Result<()> {
    let socket = bind_udp_v6(&lease.bridge, v6::SERVER_PORT)?;
    info!(target: "dhcp", bridge = %lease.bridge, "serving DHCPv6");

    let mut buf = vec![0u8; 1500];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await.context("receiving DHCPv6")?;
        let request = match v6::Message::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "dhcp", %from, "ignoring malformed DHCPv6 message: {:#}", e);
                continue;
            }
        };

        let Some(reply) = v6::respond(&lease, &request) else {
            continue;
        };
        debug!(target: "dhcp", %from, kind = ?reply.message_type(), "sending DHCPv6 reply");
        if let Err(e) = socket.send_to(&reply.encode(), from).await {
            warn!(target: "dhcp", %from, "failed to send DHCPv6 reply: {}", e);
        }
    }
}

/// Start a DHCPv4 responder per lease, plus DHCPv6 when enabled.
///
/// Pass-through interfaces get none; the guest sees the container's own
/// network directly. A responder that dies is logged, the VM keeps running.
pub fn spawn_responders(setup: &NetworkSetup, dhcpv6: bool) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for lease in &setup.leases {
        let v4_lease = lease.clone();
        handles.push(tokio::spawn(async move {
            let bridge = v4_lease.bridge.clone();
            if let Err(e) = serve_v4(v4_lease).await {
                warn!(target: "dhcp", %bridge, "DHCPv4 responder stopped: {:#}", e);
            }
        }));

        if dhcpv6 {
            let v6_lease = lease.clone();
            handles.push(tokio::spawn(async move {
                let bridge = v6_lease.bridge.clone();
                if let Err(e) = serve_v6(v6_lease).await {
                    warn!(target: "dhcp", %bridge, "DHCPv6 responder stopped: {:#}", e);
                }
            }));
        }
    }

    handles
}
