//! IPv4 and UDP datagram construction/parsing.
//!
//! Only what the embedded DHCP client needs: a builder for UDP-over-IPv4
//! datagrams (TTL 64, DF, header checksum, UDP checksum 0 as IPv4 permits)
//! and an IHL-aware parser for the receive path.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// IP protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Standard 16-bit one's-complement checksum over a header.
fn header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = header.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a UDP datagram inside an IPv4 packet.
pub fn build_udp_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buf = BytesMut::with_capacity(total_len);

    buf.put_u8(0x45); // version 4, IHL 5
    buf.put_u8(0x00); // DSCP/ECN
    buf.put_u16(total_len as u16);
    buf.put_u16(0); // identification
    buf.put_u16(0x4000); // DF, fragment offset 0
    buf.put_u8(64); // TTL
    buf.put_u8(PROTO_UDP);
    buf.put_u16(0); // checksum placeholder
    buf.put_slice(&src_ip.octets());
    buf.put_slice(&dst_ip.octets());

    let checksum = header_checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u16(udp_len as u16);
    buf.put_u16(0); // UDP checksum 0 is valid for IPv4
    buf.put_slice(payload);

    buf.freeze()
}

/// Parsed IPv4 packet view.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    /// Parse the header, honoring IHL for the payload offset.
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(packet[0] & 0x0F) * 4;
        if ihl < IPV4_HEADER_LEN || packet.len() < ihl {
            return None;
        }
        let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
        if total_len < ihl || total_len > packet.len() {
            return None;
        }
        Some(Self {
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
            protocol: packet[9],
            payload: &packet[ihl..total_len],
        })
    }

    /// Destination address of an outbound IPv4 packet without full parsing.
    pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
            return None;
        }
        Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
    }
}

/// Parsed UDP datagram view.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(segment: &'a [u8]) -> Option<Self> {
        if segment.len() < UDP_HEADER_LEN {
            return None;
        }
        let length = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
        if length < UDP_HEADER_LEN || length > segment.len() {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            payload: &segment[UDP_HEADER_LEN..length],
        })
    }
}

/// Whether `dst` sits in the same subnet as `local` under `mask`.
pub fn is_on_link(dst: Ipv4Addr, local: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let m = u32::from(mask);
    (u32::from(dst) & m) == (u32::from(local) & m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_roundtrip() {
        let built = build_udp_datagram(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::BROADCAST,
            68,
            67,
            b"dhcp-payload",
        );
        let ip = Ipv4Packet::parse(&built).unwrap();
        assert_eq!(ip.src, Ipv4Addr::UNSPECIFIED);
        assert_eq!(ip.dst, Ipv4Addr::BROADCAST);
        assert_eq!(ip.protocol, PROTO_UDP);
        let udp = UdpDatagram::parse(ip.payload).unwrap();
        assert_eq!(udp.src_port, 68);
        assert_eq!(udp.dst_port, 67);
        assert_eq!(udp.payload, b"dhcp-payload");
    }

    #[test]
    fn checksum_verifies() {
        let built = build_udp_datagram(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 1),
            68,
            67,
            &[1, 2, 3],
        );
        // One's-complement sum over a valid header is zero.
        assert_eq!(header_checksum(&built[..20]), 0);
        // TTL and DF flag as specified.
        assert_eq!(built[8], 64);
        assert_eq!(u16::from_be_bytes([built[6], built[7]]) & 0x4000, 0x4000);
    }

    #[test]
    fn parse_honors_ihl_options() {
        // 24-byte header (IHL=6) with 4 bytes of options.
        let mut packet = vec![0u8; 24 + 3];
        packet[0] = 0x46;
        packet[2..4].copy_from_slice(&(27u16).to_be_bytes());
        packet[9] = PROTO_UDP;
        packet[24..27].copy_from_slice(&[7, 8, 9]);
        let parsed = Ipv4Packet::parse(&packet).unwrap();
        assert_eq!(parsed.payload, &[7, 8, 9]);
    }

    #[test]
    fn truncated_and_nonv4_rejected() {
        assert!(Ipv4Packet::parse(&[0x45; 10]).is_none());
        let mut v6ish = vec![0u8; 40];
        v6ish[0] = 0x60;
        assert!(Ipv4Packet::parse(&v6ish).is_none());
    }

    #[test]
    fn on_link_classification() {
        let local = Ipv4Addr::new(10, 0, 0, 5);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(is_on_link(Ipv4Addr::new(10, 0, 0, 9), local, mask));
        assert!(!is_on_link(Ipv4Addr::new(8, 8, 8, 8), local, mask));
    }
}
