//! Minimal DHCPv4 (RFC 2131) codec and responder.
//!
//! Only Discover and Request are answered, and only for the lease's MAC.
//! The reply replays the stolen address, mask, gateway and DNS servers with
//! an infinite lease.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::network::types::{Lease, MacAddr};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Lease time meaning "forever"
pub const INFINITE_LEASE: u32 = u32::MAX;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// Fixed BOOTP header up to (not including) the magic cookie
const HEADER_LEN: usize = 236;
/// Some clients drop replies shorter than a BOOTP packet
const MIN_PACKET_LEN: usize = 300;

pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVERS: u8 = 6;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const END: u8 = 255;
}

/// Options sent when the client doesn't ask for anything specific
const DEFAULT_OPTION_ORDER: [u8; 3] = [opt::SUBNET_MASK, opt::ROUTER, opt::DNS_SERVERS];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    /// Options in wire order, without PAD/END
    pub options: Vec<(u8, Vec<u8>)>,
}

fn get_ipv4(buf: &mut &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32())
}

impl Packet {
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + MAGIC_COOKIE.len() {
            bail!("packet too short: {} bytes", buf.len());
        }

        let op = buf.get_u8();
        let htype = buf.get_u8();
        let hlen = buf.get_u8();
        let hops = buf.get_u8();
        let xid = buf.get_u32();
        let secs = buf.get_u16();
        let flags = buf.get_u16();
        let ciaddr = get_ipv4(&mut buf);
        let yiaddr = get_ipv4(&mut buf);
        let siaddr = get_ipv4(&mut buf);
        let giaddr = get_ipv4(&mut buf);
        let mut chaddr = [0u8; 16];
        buf.copy_to_slice(&mut chaddr);
        // sname + file
        buf.advance(64 + 128);

        let mut cookie = [0u8; 4];
        buf.copy_to_slice(&mut cookie);
        if cookie != MAGIC_COOKIE {
            bail!("bad magic cookie {:?}", cookie);
        }

        let mut options = Vec::new();
        while buf.has_remaining() {
            let code = buf.get_u8();
            match code {
                opt::PAD => continue,
                opt::END => break,
                _ => {
                    if !buf.has_remaining() {
                        bail!("option {} truncated", code);
                    }
                    let len = buf.get_u8() as usize;
                    if buf.remaining() < len {
                        bail!("option {} truncated", code);
                    }
                    options.push((code, buf[..len].to_vec()));
                    buf.advance(len);
                }
            }
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MIN_PACKET_LEN);
        buf.put_u8(self.op);
        buf.put_u8(self.htype);
        buf.put_u8(self.hlen);
        buf.put_u8(self.hops);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            buf.put_slice(&addr.octets());
        }
        buf.put_slice(&self.chaddr);
        buf.put_bytes(0, 64 + 128);
        buf.put_slice(&MAGIC_COOKIE);

        for (code, value) in &self.options {
            // values longer than 255 bytes are split into repeated options (RFC 3396)
            for chunk in value.chunks(255) {
                buf.put_u8(*code);
                buf.put_u8(chunk.len() as u8);
                buf.put_slice(chunk);
            }
        }
        buf.put_u8(opt::END);

        if buf.len() < MIN_PACKET_LEN {
            let pad = MIN_PACKET_LEN - buf.len();
            buf.put_bytes(opt::PAD, pad);
        }
        buf.to_vec()
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(opt::MESSAGE_TYPE)? {
            [value] => MessageType::from_u8(*value),
            _ => None,
        }
    }

    pub fn client_mac(&self) -> Option<MacAddr> {
        if self.htype != HTYPE_ETHERNET || self.hlen != 6 {
            return None;
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        Some(MacAddr(mac))
    }

    pub fn requested_options(&self) -> &[u8] {
        self.option(opt::PARAMETER_REQUEST_LIST).unwrap_or_default()
    }
}

/// Server identifier advertised for a lease: the gateway, or another host
/// address in the leased subnet when there is no gateway.
pub fn server_id(lease: &Lease) -> Ipv4Addr {
    if let Some(gw) = lease.gateway {
        return gw;
    }
    let first = u32::from(lease.ip.network()).wrapping_add(1);
    if first == u32::from(lease.ip.addr) {
        Ipv4Addr::from(first.wrapping_add(1))
    } else {
        Ipv4Addr::from(first)
    }
}

fn option_value(lease: &Lease, code: u8) -> Option<Vec<u8>> {
    match code {
        opt::SUBNET_MASK => Some(lease.ip.mask().octets().to_vec()),
        opt::ROUTER => lease.gateway.map(|gw| gw.octets().to_vec()),
        opt::DNS_SERVERS if !lease.dns.is_empty() => {
            Some(lease.dns.iter().flat_map(|a| a.octets()).collect())
        }
        _ => None,
    }
}

/// Build the reply for `request`, or None when it must be silently dropped
/// (foreign MAC, unsupported message type, not a request).
pub fn respond(lease: &Lease, request: &Packet) -> Option<Packet> {
    if request.op != BOOTREQUEST {
        return None;
    }
    let reply_type = match request.message_type()? {
        MessageType::Discover => MessageType::Offer,
        MessageType::Request => MessageType::Ack,
        _ => return None,
    };
    if request.client_mac()? != lease.mac {
        return None;
    }

    let mut options = vec![
        (opt::MESSAGE_TYPE, vec![reply_type as u8]),
        (opt::SERVER_ID, server_id(lease).octets().to_vec()),
        (opt::LEASE_TIME, INFINITE_LEASE.to_be_bytes().to_vec()),
    ];

    let requested = request.requested_options();
    let order = if requested.is_empty() {
        &DEFAULT_OPTION_ORDER[..]
    } else {
        requested
    };
    for &code in order {
        if options.iter().any(|(c, _)| *c == code) {
            continue;
        }
        if let Some(value) = option_value(lease, code) {
            options.push((code, value));
        }
    }

    Some(Packet {
        op: BOOTREPLY,
        htype: request.htype,
        hlen: request.hlen,
        hops: 0,
        xid: request.xid,
        secs: 0,
        flags: request.flags,
        ciaddr: request.ciaddr,
        yiaddr: lease.ip.addr,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: request.giaddr,
        chaddr: request.chaddr,
        options,
    })
}

/// Where a reply to `request` goes: relay, configured client, or broadcast
pub fn reply_destination(request: &Packet) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, SERVER_PORT)
    } else if !request.ciaddr.is_unspecified() {
        SocketAddrV4::new(request.ciaddr, CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
    }
}
