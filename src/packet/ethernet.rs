//! Ethernet II framing (no VLAN, no trailer).

use bytes::{BufMut, Bytes, BytesMut};

/// Ethernet header size.
pub const HEADER_SIZE: usize = 14;

/// Broadcast MAC address.
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

/// All-zero MAC, used for unresolved best-effort sends.
pub const ZERO_MAC: [u8; 6] = [0x00; 6];

/// EtherTypes the tunnel recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Ipv6 = 0x86DD,
}

impl EtherType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            0x86DD => Some(Self::Ipv6),
            _ => None,
        }
    }
}

/// A parsed Ethernet frame view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    /// Parse a frame; payload may be empty.
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            dst: frame[0..6].try_into().unwrap(),
            src: frame[6..12].try_into().unwrap(),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
            payload: &frame[HEADER_SIZE..],
        })
    }

    pub fn kind(&self) -> Option<EtherType> {
        EtherType::from_u16(self.ethertype)
    }
}

/// Build an Ethernet frame.
pub fn build_frame(dst: &[u8; 6], src: &[u8; 6], ethertype: EtherType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(dst);
    buf.put_slice(src);
    buf.put_u16(ethertype as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Format a MAC for logs.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
