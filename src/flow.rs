//! Capability interfaces toward the host.
//!
//! The session core consumes three collaborators (packet flow, settings
//! applier, credential source) and exposes one (the app-message handler).
//! All are small traits; the host composes them however it likes.

use crate::error::Result;
use crate::protocol::handshake::Credential;
use crate::tunnel::dhcp_client::NetworkParameters;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Protocol tag travelling with each packet through the host flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProtocol {
    Ipv4,
    Ipv6,
}

/// The host's virtual-interface packet flow.
#[async_trait]
pub trait HostFlow: Send + Sync {
    /// Wait for the next batch of outbound IP packets from the host.
    async fn read_packets(&self) -> std::io::Result<Vec<(Bytes, FlowProtocol)>>;

    /// Deliver inbound IP packets to the host.
    async fn write_packets(&self, packets: Vec<(Bytes, FlowProtocol)>) -> std::io::Result<()>;
}

/// Network settings pushed to the host once DHCP succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// The VPN server address, for the host's route exclusion.
    pub remote_address: String,
    pub addresses: Vec<Ipv4Addr>,
    pub masks: Vec<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    /// Default route is included for the tunnel.
    pub include_default_route: bool,
    pub dns_servers: Vec<Ipv4Addr>,
    /// Match-all by convention.
    pub dns_match_domains: Vec<String>,
    pub mtu: u16,
}

impl NetworkSettings {
    pub fn from_lease(remote_address: impl Into<String>, lease: &NetworkParameters) -> Self {
        Self {
            remote_address: remote_address.into(),
            addresses: vec![lease.client_ip],
            masks: vec![lease.subnet_mask],
            router: lease.gateway,
            include_default_route: true,
            dns_servers: lease.dns_servers.clone(),
            dns_match_domains: vec![String::new()],
            mtu: lease.mtu,
        }
    }
}

/// Applies negotiated settings to the host's network stack.
pub trait SettingsApplier: Send + Sync {
    fn apply(&self, settings: &NetworkSettings) -> std::result::Result<(), String>;
}

/// Supplies the credential used during the handshake.
#[async_trait]
pub trait AuthSource: Send + Sync {
    async fn credential(&self) -> Result<Credential>;
}

#[derive(Serialize)]
struct DhcpInfoPayload {
    assigned_ip: Option<String>,
    subnet_mask: Option<String>,
    gateway: Option<String>,
    dns: Vec<String>,
    mtu: u16,
}

#[derive(Serialize)]
struct DhcpInfoMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: DhcpInfoPayload,
}

/// Handle a UTF-8 app command. Known commands get a JSON reply; anything
/// else gets empty bytes.
pub fn handle_app_message(command: &[u8], lease: Option<&NetworkParameters>) -> Vec<u8> {
    match std::str::from_utf8(command) {
        Ok("dhcp_status") => {
            let payload = match lease {
                Some(lease) => DhcpInfoPayload {
                    assigned_ip: Some(lease.client_ip.to_string()),
                    subnet_mask: Some(lease.subnet_mask.to_string()),
                    gateway: lease.gateway.map(|g| g.to_string()),
                    dns: lease.dns_servers.iter().map(|d| d.to_string()).collect(),
                    mtu: lease.mtu,
                },
                None => DhcpInfoPayload {
                    assigned_ip: None,
                    subnet_mask: None,
                    gateway: None,
                    dns: Vec::new(),
                    mtu: 0,
                },
            };
            let message = DhcpInfoMessage {
                kind: "dhcp_info",
                payload,
            };
            serde_json::to_vec(&message).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::dhcp_client::DEFAULT_MTU;

    fn lease() -> NetworkParameters {
        NetworkParameters {
            client_ip: Ipv4Addr::new(10, 0, 0, 5),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dns_servers: vec![Ipv4Addr::new(10, 0, 0, 53)],
            mtu: DEFAULT_MTU,
            lease_time: 3600,
            server_id: Some(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }

    #[test]
    fn settings_from_lease() {
        let settings = NetworkSettings::from_lease("198.51.100.7", &lease());
        assert_eq!(settings.remote_address, "198.51.100.7");
        assert_eq!(settings.addresses, vec![Ipv4Addr::new(10, 0, 0, 5)]);
        assert_eq!(settings.masks, vec![Ipv4Addr::new(255, 255, 255, 0)]);
        assert_eq!(settings.router, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(settings.include_default_route);
        assert_eq!(settings.dns_match_domains, vec![String::new()]);
        assert_eq!(settings.mtu, DEFAULT_MTU);
    }

    #[test]
    fn dhcp_status_reply_shape() {
        let reply = handle_app_message(b"dhcp_status", Some(&lease()));
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["type"], "dhcp_info");
        assert_eq!(value["payload"]["assigned_ip"], "10.0.0.5");
        assert_eq!(value["payload"]["subnet_mask"], "255.255.255.0");
        assert_eq!(value["payload"]["gateway"], "10.0.0.1");
        assert_eq!(value["payload"]["dns"][0], "10.0.0.53");
        assert_eq!(value["payload"]["mtu"], 1400);
    }

    #[test]
    fn dhcp_status_without_lease_is_nulls() {
        let reply = handle_app_message(b"dhcp_status", None);
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["type"], "dhcp_info");
        assert!(value["payload"]["assigned_ip"].is_null());
    }

    #[test]
    fn unknown_command_gets_empty_reply() {
        assert!(handle_app_message(b"reload_profile", None).is_empty());
        assert!(handle_app_message(&[0xFF, 0xFE], None).is_empty());
    }
}
