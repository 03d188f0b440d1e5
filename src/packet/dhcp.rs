//! DHCP message encoding and decoding.
//!
//! Client messages are built as complete Ethernet frames (broadcast,
//! UDP 68 -> 67) around a BOOTP header and the option list. The receive
//! side filters on IPv4/UDP/ports/magic cookie before touching options.

use super::ethernet::{build_frame, EtherType, EthernetFrame, BROADCAST_MAC};
use super::ipv4::{build_udp_datagram, Ipv4Packet, UdpDatagram, PROTO_UDP};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// DHCP magic cookie.
pub const DHCP_MAGIC: u32 = 0x6382_5363;

/// BOOTP fixed header plus cookie.
const BOOTP_LEN: usize = 236;

/// DHCP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
}

impl DhcpMessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            _ => None,
        }
    }
}

mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS: u8 = 6;
    pub const DOMAIN_NAME: u8 = 15;
    pub const BROADCAST: u8 = 28;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_LIST: u8 = 55;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const END: u8 = 255;
}

/// Parameter request list sent with DISCOVER and REQUEST.
const PARAMETER_LIST: [u8; 8] = [
    opt::SUBNET_MASK,
    opt::ROUTER,
    opt::DNS,
    opt::DOMAIN_NAME,
    opt::BROADCAST,
    opt::LEASE_TIME,
    opt::RENEWAL_TIME,
    opt::REBINDING_TIME,
];

/// Parameters for building one client message.
#[derive(Debug, Clone, Copy)]
pub struct DhcpRequestSpec {
    pub msg_type: DhcpMessageType,
    pub xid: u32,
    pub client_mac: [u8; 6],
    /// Option 50 when present.
    pub requested_ip: Option<Ipv4Addr>,
    /// Option 54 when present.
    pub server_id: Option<Ipv4Addr>,
    /// ciaddr; set when renewing an existing lease.
    pub client_ip: Ipv4Addr,
}

impl DhcpRequestSpec {
    pub fn discover(xid: u32, client_mac: [u8; 6]) -> Self {
        Self {
            msg_type: DhcpMessageType::Discover,
            xid,
            client_mac,
            requested_ip: None,
            server_id: None,
            client_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn request(xid: u32, client_mac: [u8; 6], offered: Ipv4Addr, server_id: Ipv4Addr) -> Self {
        Self {
            msg_type: DhcpMessageType::Request,
            xid,
            client_mac,
            requested_ip: Some(offered),
            server_id: Some(server_id),
            client_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn renewal(xid: u32, client_mac: [u8; 6], client_ip: Ipv4Addr) -> Self {
        Self {
            msg_type: DhcpMessageType::Request,
            xid,
            client_mac,
            requested_ip: None,
            server_id: None,
            client_ip,
        }
    }
}

/// Build the DHCP payload (BOOTP header + cookie + options).
fn build_payload(spec: &DhcpRequestSpec) -> Bytes {
    let mut buf = BytesMut::with_capacity(BOOTP_LEN + 64);

    buf.put_u8(1); // op: BOOTREQUEST
    buf.put_u8(1); // htype: Ethernet
    buf.put_u8(6); // hlen
    buf.put_u8(0); // hops
    buf.put_u32(spec.xid);
    buf.put_u16(0); // secs
    buf.put_u16(0); // flags
    buf.put_slice(&spec.client_ip.octets()); // ciaddr
    buf.put_slice(&[0u8; 4]); // yiaddr
    buf.put_slice(&[0u8; 4]); // siaddr
    buf.put_slice(&[0u8; 4]); // giaddr
    buf.put_slice(&spec.client_mac); // chaddr, MAC then padding
    buf.put_slice(&[0u8; 10]);
    buf.put_slice(&[0u8; 192]); // sname + file
    buf.put_u32(DHCP_MAGIC);

    buf.put_u8(opt::MESSAGE_TYPE);
    buf.put_u8(1);
    buf.put_u8(spec.msg_type as u8);

    if let Some(ip) = spec.requested_ip {
        buf.put_u8(opt::REQUESTED_IP);
        buf.put_u8(4);
        buf.put_slice(&ip.octets());
    }
    if let Some(ip) = spec.server_id {
        buf.put_u8(opt::SERVER_ID);
        buf.put_u8(4);
        buf.put_slice(&ip.octets());
    }

    buf.put_u8(opt::PARAMETER_LIST);
    buf.put_u8(PARAMETER_LIST.len() as u8);
    buf.put_slice(&PARAMETER_LIST);

    buf.put_u8(opt::END);
    buf.freeze()
}

/// Build a broadcast DHCP frame (initial DISCOVER/REQUEST).
pub fn build_broadcast_frame(spec: &DhcpRequestSpec) -> Bytes {
    let payload = build_payload(spec);
    let datagram = build_udp_datagram(
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::BROADCAST,
        68,
        67,
        &payload,
    );
    build_frame(&BROADCAST_MAC, &spec.client_mac, EtherType::Ipv4, &datagram)
}

/// Build a unicast DHCP frame (lease renewal straight to the server).
pub fn build_unicast_frame(spec: &DhcpRequestSpec, server_ip: Ipv4Addr, dst_mac: [u8; 6]) -> Bytes {
    let payload = build_payload(spec);
    let datagram = build_udp_datagram(spec.client_ip, server_ip, 68, 67, &payload);
    build_frame(&dst_mac, &spec.client_mac, EtherType::Ipv4, &datagram)
}

/// A server reply that survived filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpReply {
    pub msg_type: Option<DhcpMessageType>,
    pub xid: u32,
    pub yiaddr: Ipv4Addr,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub lease_time: u32,
    pub renewal_time: u32,
}

impl Default for DhcpReply {
    fn default() -> Self {
        Self {
            msg_type: None,
            xid: 0,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            subnet_mask: None,
            router: None,
            dns_servers: Vec::new(),
            server_id: None,
            lease_time: 0,
            renewal_time: 0,
        }
    }
}

impl DhcpReply {
    /// Extract a DHCP server reply from an Ethernet frame.
    ///
    /// Returns `None` for anything that is not IPv4 / UDP / 67->68 / magic
    /// cookie; those frames simply belong to other subsystems.
    pub fn from_ethernet(frame: &[u8]) -> Option<Self> {
        let eth = EthernetFrame::parse(frame)?;
        if eth.kind() != Some(EtherType::Ipv4) {
            return None;
        }
        let ip = Ipv4Packet::parse(eth.payload)?;
        if ip.protocol != PROTO_UDP {
            return None;
        }
        let udp = UdpDatagram::parse(ip.payload)?;
        if udp.src_port != 67 || udp.dst_port != 68 {
            return None;
        }
        Self::from_payload(udp.payload)
    }

    fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < BOOTP_LEN + 4 {
            return None;
        }
        let cookie = u32::from_be_bytes(payload[BOOTP_LEN..BOOTP_LEN + 4].try_into().unwrap());
        if cookie != DHCP_MAGIC {
            return None;
        }

        let mut reply = DhcpReply {
            xid: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
            yiaddr: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
            ..Default::default()
        };

        let mut cursor = BOOTP_LEN + 4;
        while cursor < payload.len() {
            let code = payload[cursor];
            if code == opt::END {
                break;
            }
            if code == opt::PAD {
                cursor += 1;
                continue;
            }
            if cursor + 1 >= payload.len() {
                break;
            }
            let len = usize::from(payload[cursor + 1]);
            if cursor + 2 + len > payload.len() {
                break;
            }
            let data = &payload[cursor + 2..cursor + 2 + len];
            match code {
                opt::MESSAGE_TYPE if len >= 1 => {
                    reply.msg_type = DhcpMessageType::from_u8(data[0]);
                }
                opt::SUBNET_MASK if len >= 4 => {
                    reply.subnet_mask = Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
                }
                opt::ROUTER if len >= 4 => {
                    reply.router = Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
                }
                opt::DNS => {
                    for quad in data.chunks_exact(4) {
                        reply
                            .dns_servers
                            .push(Ipv4Addr::new(quad[0], quad[1], quad[2], quad[3]));
                    }
                }
                opt::SERVER_ID if len >= 4 => {
                    reply.server_id = Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
                }
                opt::LEASE_TIME if len >= 4 => {
                    reply.lease_time = u32::from_be_bytes(data[..4].try_into().unwrap());
                }
                opt::RENEWAL_TIME if len >= 4 => {
                    reply.renewal_time = u32::from_be_bytes(data[..4].try_into().unwrap());
                }
                _ => {}
            }
            cursor += 2 + len;
        }

        Some(reply)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for server-side replies used by the DHCP client tests.

    use super::*;

    pub struct ReplyOptions {
        pub msg_type: DhcpMessageType,
        pub xid: u32,
        pub yiaddr: Ipv4Addr,
        pub subnet_mask: Option<Ipv4Addr>,
        pub router: Option<Ipv4Addr>,
        pub dns: Vec<Ipv4Addr>,
        pub server_id: Option<Ipv4Addr>,
        pub lease_time: u32,
    }

    pub fn build_server_reply(options: &ReplyOptions) -> Bytes {
        let mut buf = BytesMut::with_capacity(BOOTP_LEN + 64);
        buf.put_u8(2); // BOOTREPLY
        buf.put_u8(1);
        buf.put_u8(6);
        buf.put_u8(0);
        buf.put_u32(options.xid);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_slice(&[0u8; 4]);
        buf.put_slice(&options.yiaddr.octets());
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 16]);
        buf.put_slice(&[0u8; 192]);
        buf.put_u32(DHCP_MAGIC);

        buf.put_u8(opt::MESSAGE_TYPE);
        buf.put_u8(1);
        buf.put_u8(options.msg_type as u8);
        if let Some(mask) = options.subnet_mask {
            buf.put_u8(opt::SUBNET_MASK);
            buf.put_u8(4);
            buf.put_slice(&mask.octets());
        }
        if let Some(router) = options.router {
            buf.put_u8(opt::ROUTER);
            buf.put_u8(4);
            buf.put_slice(&router.octets());
        }
        if !options.dns.is_empty() {
            buf.put_u8(opt::DNS);
            buf.put_u8((options.dns.len() * 4) as u8);
            for server in &options.dns {
                buf.put_slice(&server.octets());
            }
        }
        if let Some(server_id) = options.server_id {
            buf.put_u8(opt::SERVER_ID);
            buf.put_u8(4);
            buf.put_slice(&server_id.octets());
        }
        if options.lease_time > 0 {
            buf.put_u8(opt::LEASE_TIME);
            buf.put_u8(4);
            buf.put_u32(options.lease_time);
        }
        buf.put_u8(opt::END);

        let datagram = build_udp_datagram(
            options.server_id.unwrap_or(Ipv4Addr::new(10, 0, 0, 1)),
            Ipv4Addr::BROADCAST,
            67,
            68,
            &buf,
        );
        build_frame(
            &BROADCAST_MAC,
            &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            EtherType::Ipv4,
            &datagram,
        )
    }
}
