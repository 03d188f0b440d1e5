//! Embedded sub-protocols that gate the tunnel's usability: the DHCP
//! client that obtains the address and the ARP resolver that steers
//! next-hop MACs.

pub mod arp_resolver;
pub mod dhcp_client;

pub use arp_resolver::ArpResolver;
pub use dhcp_client::{
    DhcpClient, DhcpClientState, DhcpEvent, NetworkParameters, DEFAULT_MTU,
};
