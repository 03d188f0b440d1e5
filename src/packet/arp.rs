//! ARP payload encoding (28 bytes, Ethernet/IPv4 only).

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Encoded ARP payload length.
pub const ARP_PAYLOAD_LEN: usize = 28;

/// ARP operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

/// A decoded ARP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: [0u8; 6],
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: [u8; 6],
        sender_ip: Ipv4Addr,
        target_mac: [u8; 6],
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            op: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Gratuitous announcement: a reply where sender and target are both us.
    pub fn gratuitous(mac: [u8; 6], ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Reply,
            sender_mac: mac,
            sender_ip: ip,
            target_mac: mac,
            target_ip: ip,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ARP_PAYLOAD_LEN);
        buf.put_u16(1); // hardware type: Ethernet
        buf.put_u16(0x0800); // protocol type: IPv4
        buf.put_u8(6); // hardware address length
        buf.put_u8(4); // protocol address length
        buf.put_u16(self.op as u16);
        buf.put_slice(&self.sender_mac);
        buf.put_slice(&self.sender_ip.octets());
        buf.put_slice(&self.target_mac);
        buf.put_slice(&self.target_ip.octets());
        buf.freeze()
    }

    /// Decode an ARP payload (the 28 bytes after the Ethernet header).
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < ARP_PAYLOAD_LEN {
            return None;
        }
        let hw = u16::from_be_bytes([payload[0], payload[1]]);
        let proto = u16::from_be_bytes([payload[2], payload[3]]);
        if hw != 1 || proto != 0x0800 || payload[4] != 6 || payload[5] != 4 {
            return None;
        }
        let op = match u16::from_be_bytes([payload[6], payload[7]]) {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            _ => return None,
        };
        Some(Self {
            op,
            sender_mac: payload[8..14].try_into().unwrap(),
            sender_ip: Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17]),
            target_mac: payload[18..24].try_into().unwrap(),
            target_ip: Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]),
        })
    }
}
