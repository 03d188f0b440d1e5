//! Session configuration.
//!
//! The host app hands over a provider configuration blob; everything the
//! core needs is validated out of it before any I/O happens. The core
//! itself only ever sees the distilled [`SessionConfig`].

use crate::error::{Error, Result};
use crate::protocol::handshake::ClientBanner;
use serde::Deserialize;
use std::net::Ipv4Addr;

/// TLS certificate handling for the control channel.
///
/// The SoftEther handshake bootstraps its own trust on top of the TLS
/// layer, so the historical default is to accept any certificate. Leaf
/// pinning is available for deployments that want the transport itself
/// authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsVerification {
    /// Accept any server certificate.
    #[default]
    AcceptAny,
    /// Require the server leaf certificate's SHA-256 to match.
    PinnedLeafSha256([u8; 32]),
    /// Standard web-PKI verification against the bundled roots.
    WebPki,
}

/// OIDC group from the provider configuration. Only used to locate a
/// cached credential; the interactive flow lives outside the core.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct OidcConfig {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub client_id: String,
}

/// Raw provider configuration, as stored by the host app.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub se_host: Option<String>,
    pub se_port: Option<u16>,
    pub se_hub: Option<String>,
    pub profile_name: Option<String>,
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

impl ProviderConfig {
    /// Validate into a [`SessionConfig`]. Fails before any I/O.
    pub fn validate(&self) -> Result<SessionConfig> {
        let host = self
            .se_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ProviderConfigMissing("se_host".into()))?;
        let host: Ipv4Addr = host.parse().map_err(|_| {
            Error::ProviderConfigInvalid(format!("se_host must be a literal IPv4 address: {host:?}"))
        })?;
        let port = self
            .se_port
            .ok_or_else(|| Error::ProviderConfigMissing("se_port".into()))?;
        if port == 0 {
            return Err(Error::ProviderConfigInvalid("se_port must be non-zero".into()));
        }
        let hub = self
            .se_hub
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ProviderConfigMissing("se_hub".into()))?;

        Ok(SessionConfig {
            host,
            port,
            hub: hub.to_string(),
            profile_name: self.profile_name.clone().unwrap_or_default(),
            oidc: self.oidc.clone().unwrap_or_default(),
            udp_acceleration: true,
            banner: ClientBanner::default(),
            tls_verification: TlsVerification::default(),
        })
    }
}

/// Everything the session core needs, explicitly injected.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    pub hub: String,
    pub profile_name: String,
    pub oidc: OidcConfig,
    /// Whether to negotiate the UDP data path.
    pub udp_acceleration: bool,
    pub banner: ClientBanner,
    pub tls_verification: TlsVerification,
}

impl SessionConfig {
    pub fn new(host: Ipv4Addr, port: u16, hub: impl Into<String>) -> Self {
        Self {
            host,
            port,
            hub: hub.into(),
            profile_name: String::new(),
            oidc: OidcConfig::default(),
            udp_acceleration: true,
            banner: ClientBanner::default(),
            tls_verification: TlsVerification::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> ProviderConfig {
        serde_json::from_str(
            r#"{
                "se_host": "198.51.100.7",
                "se_port": 443,
                "se_hub": "H",
                "profile_name": "work",
                "oidc": {"issuer": "https://idp.example", "client_id": "vpn"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_provider_config() {
        let config = full().validate().unwrap();
        assert_eq!(config.host, Ipv4Addr::new(198, 51, 100, 7));
        assert_eq!(config.port, 443);
        assert_eq!(config.hub, "H");
        assert_eq!(config.profile_name, "work");
        assert_eq!(config.oidc.issuer, "https://idp.example");
        assert!(config.udp_acceleration);
        assert_eq!(config.tls_verification, TlsVerification::AcceptAny);
    }

    #[test]
    fn missing_fields_reported_before_io() {
        let mut missing_host = full();
        missing_host.se_host = None;
        assert!(matches!(
            missing_host.validate(),
            Err(Error::ProviderConfigMissing(f)) if f == "se_host"
        ));

        let mut missing_hub = full();
        missing_hub.se_hub = Some(String::new());
        assert!(matches!(
            missing_hub.validate(),
            Err(Error::ProviderConfigMissing(f)) if f == "se_hub"
        ));
    }

    #[test]
    fn hostname_rejected_hosts_must_be_literal() {
        let mut config = full();
        config.se_host = Some("vpn.example.com".into());
        assert!(matches!(
            config.validate(),
            Err(Error::ProviderConfigInvalid(_))
        ));
    }

    #[test]
    fn zero_port_rejected() {
        let mut config = full();
        config.se_port = Some(0);
        assert!(matches!(
            config.validate(),
            Err(Error::ProviderConfigInvalid(_))
        ));
    }
}
