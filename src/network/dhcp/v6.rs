//! Minimal DHCPv6 (RFC 8415) responder.
//!
//! Never hands out a routable address: each client gets a link-local address
//! derived from the link-layer address in its DUID (or seeded from the DUID
//! when there is none), which is enough for the guest to accept the DNS
//! servers we push.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv6Addr;

use crate::network::types::Lease;

pub const SERVER_PORT: u16 = 547;
pub const CLIENT_PORT: u16 = 546;

/// All_DHCP_Relay_Agents_and_Servers
pub const ALL_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

const INFINITY: u32 = u32::MAX;

pub mod opt {
    pub const CLIENT_ID: u16 = 1;
    pub const SERVER_ID: u16 = 2;
    pub const IA_NA: u16 = 3;
    pub const IA_ADDR: u16 = 5;
    pub const STATUS_CODE: u16 = 13;
    pub const DNS_SERVERS: u16 = 23;
}

pub mod status {
    pub const NO_BINDING: u16 = 3;
    pub const NOT_ON_LINK: u16 = 4;
}

const DUID_LLT: u16 = 1;
const DUID_LL: u16 = 3;
const HW_ETHERNET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Solicit,
            2 => Self::Advertise,
            3 => Self::Request,
            4 => Self::Confirm,
            5 => Self::Renew,
            6 => Self::Rebind,
            7 => Self::Reply,
            8 => Self::Release,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub transaction_id: [u8; 3],
    pub options: Vec<(u16, Vec<u8>)>,
}

fn decode_options(mut buf: &[u8]) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut options = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            bail!("option header truncated");
        }
        let code = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            bail!("option {} truncated", code);
        }
        options.push((code, buf[..len].to_vec()));
        buf.advance(len);
    }
    Ok(options)
}

fn encode_options(buf: &mut BytesMut, options: &[(u16, Vec<u8>)]) {
    for (code, value) in options {
        buf.put_u16(*code);
        buf.put_u16(value.len() as u16);
        buf.put_slice(value);
    }
}

impl Message {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            bail!("message too short: {} bytes", buf.len());
        }
        Ok(Self {
            msg_type: buf[0],
            transaction_id: [buf[1], buf[2], buf[3]],
            options: decode_options(&buf[4..])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.msg_type);
        buf.put_slice(&self.transaction_id);
        encode_options(&mut buf, &self.options);
        buf.to_vec()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    pub fn option(&self, code: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    pub fn options_of(&self, code: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }
}

/// Link-layer address embedded in a DUID-LLT or DUID-LL
pub fn duid_link_layer(duid: &[u8]) -> Option<&[u8]> {
    if duid.len() < 2 {
        return None;
    }
    let kind = u16::from_be_bytes([duid[0], duid[1]]);
    let ll = match kind {
        DUID_LLT if duid.len() > 8 => &duid[8..],
        DUID_LL if duid.len() > 4 => &duid[4..],
        _ => return None,
    };
    Some(ll)
}

/// Address handed to the client owning `duid`.
///
/// EUI-64 link-local when the DUID carries a 48-bit MAC, otherwise a
/// link-local address with an interface id drawn from an RNG seeded by the
/// DUID, so the same client always gets the same address.
pub fn guest_address(duid: &[u8]) -> Ipv6Addr {
    let iid: [u8; 8] = match duid_link_layer(duid) {
        Some(mac) if mac.len() == 6 => [
            mac[0] ^ 0x02,
            mac[1],
            mac[2],
            0xff,
            0xfe,
            mac[3],
            mac[4],
            mac[5],
        ],
        _ => {
            let mut hasher = DefaultHasher::new();
            duid.hash(&mut hasher);
            let mut rng = StdRng::seed_from_u64(hasher.finish());
            rng.gen()
        }
    };

    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8..].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}

/// DUID-LL we identify as, derived from the lease MAC with the
/// locally-administered bit flipped so it never equals the client's
pub fn server_duid(lease: &Lease) -> Vec<u8> {
    let mut mac = lease.mac.octets();
    mac[0] ^= 0x02;
    let mut duid = Vec::with_capacity(10);
    duid.extend_from_slice(&DUID_LL.to_be_bytes());
    duid.extend_from_slice(&HW_ETHERNET.to_be_bytes());
    duid.extend_from_slice(&mac);
    duid
}

fn status_option(code: u16, message: &str) -> (u16, Vec<u8>) {
    let mut value = code.to_be_bytes().to_vec();
    value.extend_from_slice(message.as_bytes());
    (opt::STATUS_CODE, value)
}

/// IA_NA with one address, valid forever
fn ia_na_with_address(iaid: [u8; 4], addr: Ipv6Addr) -> (u16, Vec<u8>) {
    let mut ia_addr = BytesMut::new();
    ia_addr.put_slice(&addr.octets());
    ia_addr.put_u32(INFINITY);
    ia_addr.put_u32(INFINITY);

    let mut ia = BytesMut::new();
    ia.put_slice(&iaid);
    ia.put_u32(INFINITY);
    ia.put_u32(INFINITY);
    encode_options(&mut ia, &[(opt::IA_ADDR, ia_addr.to_vec())]);
    (opt::IA_NA, ia.to_vec())
}

fn ia_na_with_status(iaid: [u8; 4], code: u16, message: &str) -> (u16, Vec<u8>) {
    let mut ia = BytesMut::new();
    ia.put_slice(&iaid);
    ia.put_u32(0);
    ia.put_u32(0);
    encode_options(&mut ia, &[status_option(code, message)]);
    (opt::IA_NA, ia.to_vec())
}

fn iaids(request: &Message) -> Vec<[u8; 4]> {
    request
        .options_of(opt::IA_NA)
        .filter(|ia| ia.len() >= 12)
        .map(|ia| [ia[0], ia[1], ia[2], ia[3]])
        .collect()
}

/// Build the reply for `request`, or None to drop it.
pub fn respond(lease: &Lease, request: &Message) -> Option<Message> {
    let client_id = request.option(opt::CLIENT_ID)?;
    if let Some(ll) = duid_link_layer(client_id) {
        if ll.len() == 6 && ll != lease.mac.octets() {
            return None;
        }
    }

    let kind = request.message_type()?;
    let mut options = vec![
        (opt::CLIENT_ID, client_id.to_vec()),
        (opt::SERVER_ID, server_duid(lease)),
    ];

    let reply_type = match kind {
        MessageType::Solicit
        | MessageType::Request
        | MessageType::Renew
        | MessageType::Rebind => {
            let addr = guest_address(client_id);
            for iaid in iaids(request) {
                options.push(ia_na_with_address(iaid, addr));
            }
            if !lease.dns6.is_empty() {
                let servers = lease.dns6.iter().flat_map(|a| a.octets()).collect();
                options.push((opt::DNS_SERVERS, servers));
            }
            if kind == MessageType::Solicit {
                MessageType::Advertise
            } else {
                MessageType::Reply
            }
        }
        MessageType::Confirm => {
            options.push(status_option(status::NOT_ON_LINK, "addresses are not on link"));
            MessageType::Reply
        }
        MessageType::Release => {
            for iaid in iaids(request) {
                options.push(ia_na_with_status(iaid, status::NO_BINDING, "no binding"));
            }
            MessageType::Reply
        }
        MessageType::Advertise | MessageType::Reply => return None,
    };

    Some(Message {
        msg_type: reply_type as u8,
        transaction_id: request.transaction_id,
        options,
    })
}
