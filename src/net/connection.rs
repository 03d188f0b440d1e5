//! TLS control channel.
//!
//! A TCP + TLS 1.2+ client to the configured `host:port`. The host is a
//! literal IPv4 address, so there is no resolver in the path. Certificate
//! policy is permissive by default (the SoftEther handshake supplies the
//! actual trust), with an optional leaf pin or full web-PKI verification.

use crate::config::TlsVerification;
use crate::error::{Error, Result};
use crate::protocol::http::{HttpCodec, HttpRequest, HttpResponse};
use bytes::Bytes;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace};

/// Connect timeout for TCP + TLS.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Read timeout during the HTTP handshake phase.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The session's secure control connection.
pub struct ControlChannel {
    stream: TlsStream<TcpStream>,
    peer: SocketAddrV4,
    codec: HttpCodec,
    read_buf: Vec<u8>,
}

impl ControlChannel {
    /// Establish TCP then TLS to `peer`.
    pub async fn connect(peer: SocketAddrV4, verification: &TlsVerification) -> Result<Self> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(SocketAddr::V4(peer)))
            .await
            .map_err(|_| Error::connect(format!("timed out connecting to {peer}")))?
            .map_err(|e| Error::connect(format!("TCP connect to {peer} failed: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::connect(format!("set_nodelay failed: {e}")))?;

        let tls_config = tls_client_config(verification);
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::IpAddress(IpAddr::V4(*peer.ip()).into());

        let stream = timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::connect(format!("TLS handshake with {peer} timed out")))?
            .map_err(|e| Error::connect(format!("TLS handshake with {peer} failed: {e}")))?;

        info!(%peer, "control channel established");
        Ok(Self {
            stream,
            peer,
            codec: HttpCodec::new(),
            read_buf: vec![0u8; 64 * 1024],
        })
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Write all bytes and flush.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next chunk. EOF surfaces as [`Error::TransportClosed`].
    pub async fn receive(&mut self) -> Result<Bytes> {
        let n = self.stream.read(&mut self.read_buf).await?;
        if n == 0 {
            return Err(Error::TransportClosed);
        }
        trace!(bytes = n, "control channel read");
        Ok(Bytes::copy_from_slice(&self.read_buf[..n]))
    }

    /// Read with a timeout. `Ok(None)` means the timer fired with nothing
    /// to read, which callers treat as a keep-alive no-op.
    pub async fn receive_timeout(&mut self, limit: Duration) -> Result<Option<Bytes>> {
        match timeout(limit, self.stream.read(&mut self.read_buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(Error::TransportClosed),
            Ok(Ok(n)) => Ok(Some(Bytes::copy_from_slice(&self.read_buf[..n]))),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// One HTTP round trip on the channel.
    pub async fn request(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let host = self.peer.ip().to_string();
        self.send(&request.encode(&host)).await?;
        debug!(path = %request.path, "HTTP request sent");

        self.codec.reset();
        loop {
            match self.receive_timeout(HANDSHAKE_READ_TIMEOUT).await? {
                None => {
                    return Err(Error::handshake(format!(
                        "no response to {} within {:?}",
                        request.path, HANDSHAKE_READ_TIMEOUT
                    )))
                }
                Some(chunk) => {
                    if let Some(response) = self.codec.feed(&chunk)? {
                        debug!(status = response.status, "HTTP response received");
                        return Ok(response);
                    }
                }
            }
        }
    }

    /// Bytes received past the last HTTP response; the tunnel stream can
    /// begin in the same segment.
    pub fn take_buffered(&mut self) -> Bytes {
        self.codec.take_remaining()
    }

    /// Close the write side; the peer sees EOF.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn tls_client_config(verification: &TlsVerification) -> rustls::ClientConfig {
    match verification {
        TlsVerification::WebPki => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        TlsVerification::AcceptAny => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveVerifier { pin: None }))
            .with_no_client_auth(),
        TlsVerification::PinnedLeafSha256(pin) => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveVerifier { pin: Some(*pin) }))
            .with_no_client_auth(),
    }
}

/// Accepts any chain; optionally requires the leaf to match a SHA-256 pin.
#[derive(Debug)]
struct PermissiveVerifier {
    pin: Option<[u8; 32]>,
}

impl ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.pin {
            let digest = ring::digest::digest(&ring::digest::SHA256, end_entity.as_ref());
            if digest.as_ref() != expected {
                return Err(rustls::Error::General(
                    "server certificate does not match the configured pin".into(),
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_verifier_accepts_anything() {
        let verifier = PermissiveVerifier { pin: None };
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let name = ServerName::try_from("example.com").unwrap();
        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn pinned_verifier_checks_leaf_digest() {
        let cert_bytes = vec![0x42u8; 64];
        let digest = ring::digest::digest(&ring::digest::SHA256, &cert_bytes);
        let mut pin = [0u8; 32];
        pin.copy_from_slice(digest.as_ref());

        let verifier = PermissiveVerifier { pin: Some(pin) };
        let name = ServerName::try_from("example.com").unwrap();
        let good = CertificateDer::from(cert_bytes.clone());
        assert!(verifier
            .verify_server_cert(&good, &[], &name, &[], UnixTime::now())
            .is_ok());

        let bad = CertificateDer::from(vec![0x43u8; 64]);
        assert!(verifier
            .verify_server_cert(&bad, &[], &name, &[], UnixTime::now())
            .is_err());
    }
}
