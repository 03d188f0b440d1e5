//! SoftEther-compatible Layer-2 VPN session engine.
//!
//! Establishes a session with a SoftEther-compatible server over a TLS
//! control channel, runs the pack-encoded Hello/Auth/Welcome handshake,
//! obtains an address with an embedded DHCP client, resolves next hops
//! with an embedded ARP resolver, and pumps Ethernet-framed IP packets
//! between the host's packet flow and the server, over an AEAD-protected
//! UDP data path while it is live and over TCP otherwise.
//!
//! The host side plugs in through small capability traits: [`HostFlow`],
//! [`SettingsApplier`], and [`AuthSource`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod flow;
pub mod net;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod tunnel;

pub use config::{ProviderConfig, SessionConfig, TlsVerification};
pub use error::{AuthError, DhcpError, Error, Result};
pub use flow::{AuthSource, FlowProtocol, HostFlow, NetworkSettings, SettingsApplier};
pub use protocol::handshake::{ClientBanner, Credential, Welcome};
pub use session::{Session, SessionState, SessionStats};
pub use tunnel::dhcp_client::NetworkParameters;

/// Client identification string sent to the server.
pub const CLIENT_STRING: &str = "SoftEther VPN Client";

/// Client version number sent to the server.
pub const CLIENT_VERSION: u32 = 444;

/// Client build number sent to the server.
pub const CLIENT_BUILD: u32 = 9807;
