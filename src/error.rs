//! Error types for the session engine.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a DHCP exchange can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DhcpError {
    /// Retry budget exhausted without a usable ACK.
    #[error("DHCP timed out")]
    Timeout,

    /// Server rejected our REQUEST.
    #[error("DHCP server sent NAK")]
    Nak,

    /// A frame passed the port/cookie filter but could not be parsed.
    #[error("Invalid DHCP message: {0}")]
    InvalidMessage(String),

    /// ACK was missing yiaddr or the subnet mask.
    #[error("DHCP ACK incomplete: {0}")]
    IncompleteConfig(String),

    /// Internal plumbing failure (channel closed, transport gone).
    #[error("DHCP internal error: {0}")]
    Internal(String),
}

/// Credential-resolution failures, before any authentication I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The supplied authentication options are contradictory or unsupported.
    #[error("Bad authentication options: {0}")]
    BadOptions(String),

    /// No credential of any kind was available.
    #[error("No credential available")]
    MissingCredential,

    /// The external identity collaborator failed to produce a token.
    #[error("Token acquisition failed: {0}")]
    TokenAcquisitionFailed(String),

    /// The identity collaborator returned a response without an ID token.
    #[error("Identity response carried no ID token")]
    MissingIdToken,

    /// A bearer token was present but no username could be derived from it.
    #[error("Cannot build auth parameters from token: {0}")]
    BuildAuthFromToken(String),
}

/// Main error type for the session engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Provider configuration was absent entirely.
    #[error("Provider configuration missing: {0}")]
    ProviderConfigMissing(String),

    /// Provider configuration was present but unusable.
    #[error("Provider configuration invalid: {0}")]
    ProviderConfigInvalid(String),

    /// Credential resolution failed.
    #[error("Authentication setup failed: {0}")]
    Auth(#[from] AuthError),

    /// TCP connect or TLS handshake failed.
    #[error("Session connect failed: {0}")]
    SessionConnectFailed(String),

    /// Hello/Auth/Welcome exchange failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The embedded DHCP cycle failed.
    #[error("DHCP failed: {0}")]
    DhcpFailed(#[from] DhcpError),

    /// The host refused the negotiated network settings.
    #[error("Applying network settings failed: {0}")]
    SettingsApplyFailed(String),

    /// The server closed the control channel mid-session.
    #[error("Control transport closed by peer")]
    TransportClosed,

    /// Operation attempted in a state that does not permit it.
    #[error("Operation not permitted in state {state}: {operation}")]
    BadState {
        state: &'static str,
        operation: &'static str,
    },

    /// Pack encode/decode error.
    #[error("Pack error: {0}")]
    Pack(String),

    /// I/O errors from either transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new connect error.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::SessionConnectFailed(msg.into())
    }

    /// Create a new handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// Create a new pack error.
    pub fn pack(msg: impl Into<String>) -> Self {
        Self::Pack(msg.into())
    }

    /// Create a new bad-state error.
    pub fn bad_state(state: &'static str, operation: &'static str) -> Self {
        Self::BadState { state, operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhcp_error_converts() {
        let err: Error = DhcpError::Timeout.into();
        assert!(matches!(err, Error::DhcpFailed(DhcpError::Timeout)));
    }

    #[test]
    fn bad_state_formats_both_parts() {
        let err = Error::bad_state("Stopped", "connect");
        let text = err.to_string();
        assert!(text.contains("Stopped"));
        assert!(text.contains("connect"));
    }
}
