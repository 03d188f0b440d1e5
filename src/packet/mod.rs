//! Wire formats for the Layer-2 data plane: Ethernet, IPv4/UDP, ARP, DHCP.

pub mod arp;
pub mod dhcp;
pub mod ethernet;
pub mod ipv4;

pub use arp::{ArpOp, ArpPacket};
pub use dhcp::{DhcpMessageType, DhcpReply, DhcpRequestSpec};
pub use ethernet::{build_frame, format_mac, EtherType, EthernetFrame, BROADCAST_MAC, ZERO_MAC};
pub use ipv4::{is_on_link, Ipv4Packet, UdpDatagram};
