//! Session orchestrator.
//!
//! Owns the control transport and, when negotiated, the UDP lane. Drives
//! the multi-phase lifecycle: TLS connect, Hello/Auth/Welcome, the
//! embedded DHCP exchange, then the bidirectional pump. States move
//! strictly forward; `Stopped` is terminal.

mod pump;

pub use pump::SessionStats;

use crate::config::SessionConfig;
use crate::crypto;
use crate::error::{DhcpError, Error, Result};
use crate::flow::{handle_app_message, AuthSource, HostFlow, NetworkSettings, SettingsApplier};
use crate::net::connection::ControlChannel;
use crate::net::udp_accel::{self, UdpAccelSocket, UdpHandle};
use crate::protocol::constants::{
    CONTENT_TYPE_PACK, CONTENT_TYPE_SIGNATURE, SIGNATURE_TARGET, VPN_TARGET,
};
use crate::protocol::framer::{encode_frame, StreamFramer};
use crate::protocol::handshake::{self, HelloResponse, Welcome};
use crate::protocol::http::HttpRequest;
use crate::protocol::pack::Pack;
use crate::tunnel::arp_resolver::ArpResolver;
use crate::tunnel::dhcp_client::{DhcpClient, DhcpEvent, NetworkParameters};
use bytes::Bytes;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TlsHandshaking,
    SoftEtherHandshaking,
    Established,
    Tunneling,
    /// Terminal; carries the fatal error when there was one.
    Stopped(Option<String>),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::TlsHandshaking => "TlsHandshaking",
            Self::SoftEtherHandshaking => "SoftEtherHandshaking",
            Self::Established => "Established",
            Self::Tunneling => "Tunneling",
            Self::Stopped(_) => "Stopped",
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<SessionState>>;
pub(crate) type SharedLease = Arc<Mutex<Option<NetworkParameters>>>;

/// Overall DHCP budget; the per-phase retry rules live in the client,
/// this is the hard stop for the whole exchange.
const DHCP_EXCHANGE_DEADLINE: Duration = Duration::from_secs(60);

/// Poll granularity while the DHCP exchange runs.
const DHCP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A SoftEther client session.
pub struct Session {
    config: SessionConfig,
    state: SharedState,
    mac: [u8; 6],
    control: Option<ControlChannel>,
    udp_socket: Option<UdpAccelSocket>,
    udp: Option<UdpHandle>,
    udp_frames: Option<mpsc::Receiver<Bytes>>,
    welcome: Option<Welcome>,
    dhcp: Option<DhcpClient>,
    lease: SharedLease,
    stats: Arc<SessionStats>,
    buffered: Bytes,
    pump_shutdown: Option<mpsc::Sender<()>>,
    pump_task: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a session around a validated configuration. Generates the
    /// per-session virtual MAC.
    pub fn new(config: SessionConfig) -> Self {
        let mac = crypto::generate_session_mac();
        debug!(mac = %crate::packet::ethernet::format_mac(&mac), "session created");
        Self {
            config,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            mac,
            control: None,
            udp_socket: None,
            udp: None,
            udp_frames: None,
            welcome: None,
            dhcp: None,
            lease: Arc::new(Mutex::new(None)),
            stats: Arc::new(SessionStats::default()),
            buffered: Bytes::new(),
            pump_shutdown: None,
            pump_task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().expect("state mutex").clone()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// The session's virtual MAC address.
    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Session parameters from the Welcome, once handshaken.
    pub fn welcome(&self) -> Option<&Welcome> {
        self.welcome.as_ref()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("state mutex");
        debug!(from = state.name(), to = next.name(), "session state");
        *state = next;
    }

    fn expect_state(&self, expected: &SessionState, operation: &'static str) -> Result<()> {
        let state = self.state();
        if &state != expected {
            return Err(Error::bad_state(state.name(), operation));
        }
        Ok(())
    }

    fn control_peer(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.config.host, self.config.port)
    }

    /// Establish the TLS control channel.
    ///
    /// `Idle -> TlsHandshaking -> SoftEtherHandshaking` on success.
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state(&SessionState::Idle, "connect")?;
        self.set_state(SessionState::TlsHandshaking);

        match ControlChannel::connect(self.control_peer(), &self.config.tls_verification).await {
            Ok(control) => {
                self.control = Some(control);
                self.set_state(SessionState::SoftEtherHandshaking);
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    e @ Error::SessionConnectFailed(_) => e,
                    other => Error::connect(other.to_string()),
                };
                self.stop_with(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Run Hello/Auth/Welcome. On success the session is `Established`
    /// and, when the Welcome advertises acceleration v2, the UDP lane is
    /// running.
    pub async fn handshake(&mut self, auth: &dyn AuthSource) -> Result<()> {
        self.expect_state(&SessionState::SoftEtherHandshaking, "handshake")?;

        match self.run_handshake(auth).await {
            Ok(()) => {
                self.set_state(SessionState::Established);
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    e @ (Error::HandshakeFailed(_) | Error::Auth(_)) => e,
                    other => Error::handshake(other.to_string()),
                };
                self.stop_with(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn run_handshake(&mut self, auth: &dyn AuthSource) -> Result<()> {
        let credential = auth.credential().await?;
        let peer = self.control_peer();
        let control = self
            .control
            .as_mut()
            .ok_or(Error::TransportClosed)?;

        // Hello: watermark POST, server answers with its random.
        let hello_request = HttpRequest::post(
            SIGNATURE_TARGET,
            CONTENT_TYPE_SIGNATURE,
            handshake::hello_body(),
        );
        let response = control.request(&hello_request).await?;
        if !response.is_success() {
            return Err(Error::handshake(format!(
                "Hello rejected with HTTP {}",
                response.status
            )));
        }
        let hello = HelloResponse::from_pack(&Pack::from_bytes(&response.body)?)?;
        info!(
            server = %hello.server_banner,
            version = hello.server_version,
            build = hello.server_build,
            "server hello"
        );

        // Bind the UDP socket first so its observed address can be
        // advertised in the login Pack.
        let advertisement = if self.config.udp_acceleration {
            let socket = UdpAccelSocket::bind(peer)?;
            let advertisement = socket.advertisement();
            self.udp_socket = Some(socket);
            Some(advertisement)
        } else {
            None
        };

        let auth_pack = handshake::build_auth_pack(
            &self.config.hub,
            &credential,
            &hello.random,
            &self.config.banner,
            advertisement.as_ref(),
        )?;
        debug!(pack = %auth_pack.redacted(), "sending auth");

        let auth_request =
            HttpRequest::post(VPN_TARGET, CONTENT_TYPE_PACK, auth_pack.to_bytes());
        let response = control.request(&auth_request).await?;
        if !response.is_success() {
            return Err(Error::handshake(format!(
                "Auth rejected with HTTP {}",
                response.status
            )));
        }

        let welcome = Welcome::from_pack(&Pack::from_bytes(&response.body)?, *peer.ip())?;
        info!(
            session = %welcome.session_name,
            connection = %welcome.connection_name,
            policies = welcome.policy.len(),
            "welcome received"
        );
        if let Some(message) = &welcome.message {
            info!(server_message = %message);
        }

        // Tunnel bytes may already trail the Welcome body.
        self.buffered = control.take_buffered();

        // Start the UDP lane when both sides agreed on v2.
        match (&welcome.udp_accel, self.udp_socket.take()) {
            (Some(params), Some(socket)) => {
                let (frame_tx, frame_rx) = mpsc::channel(512);
                let handle = udp_accel::spawn(socket, params, *peer.ip(), frame_tx)?;
                self.udp = Some(handle);
                self.udp_frames = Some(frame_rx);
            }
            (None, _) => debug!("server did not negotiate UDP acceleration"),
            (Some(_), None) => {
                warn!("welcome advertised UDP acceleration but it is disabled locally");
            }
        }

        self.welcome = Some(welcome);
        Ok(())
    }

    /// Run the embedded DHCP exchange over the TCP channel and return the
    /// negotiated network parameters.
    pub async fn obtain_ip_via_dhcp(&mut self) -> Result<NetworkParameters> {
        self.expect_state(&SessionState::Established, "obtain_ip_via_dhcp")?;

        match self.run_dhcp().await {
            Ok(params) => {
                *self.lease.lock().expect("lease mutex") = Some(params.clone());
                Ok(params)
            }
            Err(e) => {
                let e = match e {
                    e @ Error::DhcpFailed(_) => e,
                    Error::TransportClosed => Error::TransportClosed,
                    other => Error::DhcpFailed(DhcpError::Internal(other.to_string())),
                };
                self.stop_with(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn run_dhcp(&mut self) -> Result<NetworkParameters> {
        let control = self.control.as_mut().ok_or(Error::TransportClosed)?;
        let mut framer = StreamFramer::new();
        let mut dhcp = DhcpClient::new(self.mac);

        let started = Instant::now();
        let mut last_tick = started;

        // Seed the framer with bytes that arrived behind the Welcome.
        let mut frames = Vec::new();
        let seed = std::mem::take(&mut self.buffered);
        if !seed.is_empty() {
            framer.feed(&seed, &mut frames)?;
        }

        let mut pending: Vec<DhcpEvent> = dhcp.start(started);

        loop {
            // Drain events from the previous step.
            for event in std::mem::take(&mut pending) {
                match event {
                    DhcpEvent::Transmit(frame) => {
                        control.send(&encode_frame(&frame)).await?;
                    }
                    DhcpEvent::Bound(params) => {
                        self.dhcp = Some(dhcp);
                        return Ok(params);
                    }
                    DhcpEvent::Renewed(params) => {
                        self.dhcp = Some(dhcp);
                        return Ok(params);
                    }
                    DhcpEvent::Failed(e) => return Err(e.into()),
                }
            }

            for frame in std::mem::take(&mut frames) {
                let now = Instant::now();
                pending.extend(dhcp.handle_frame(&frame, now));
            }
            if !pending.is_empty() {
                continue;
            }

            if started.elapsed() > DHCP_EXCHANGE_DEADLINE {
                return Err(DhcpError::Timeout.into());
            }

            match control.receive_timeout(DHCP_POLL_INTERVAL).await? {
                Some(chunk) => framer.feed(&chunk, &mut frames)?,
                None => {}
            }

            let now = Instant::now();
            if now.duration_since(last_tick) >= Duration::from_secs(1) {
                last_tick = now;
                pending.extend(dhcp.tick(now));
            }
        }
    }

    /// Apply settings to the host and start the bidirectional pump.
    pub async fn start_tunneling(
        &mut self,
        flow: Arc<dyn HostFlow>,
        settings: &dyn SettingsApplier,
    ) -> Result<()> {
        self.expect_state(&SessionState::Established, "start_tunneling")?;
        let lease = self
            .lease
            .lock()
            .expect("lease mutex")
            .clone()
            .ok_or_else(|| Error::DhcpFailed(DhcpError::Internal("no lease bound".into())))?;

        let network_settings =
            NetworkSettings::from_lease(self.config.host.to_string(), &lease);
        if let Err(reason) = settings.apply(&network_settings) {
            let e = Error::SettingsApplyFailed(reason);
            self.stop_with(Some(e.to_string())).await;
            return Err(e);
        }

        let control = self.control.take().ok_or(Error::TransportClosed)?;
        let dhcp = self.dhcp.take().unwrap_or_else(|| DhcpClient::new(self.mac));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let pump = pump::TunnelPump {
            control,
            framer: StreamFramer::new(),
            dhcp,
            arp: ArpResolver::new(self.mac),
            flow,
            udp: self.udp.clone(),
            udp_frames: self.udp_frames.take(),
            mac: self.mac,
            shared_state: Arc::clone(&self.state),
            shared_lease: Arc::clone(&self.lease),
            stats: Arc::clone(&self.stats),
            initial_buffered: std::mem::take(&mut self.buffered),
        };

        self.set_state(SessionState::Tunneling);
        self.pump_shutdown = Some(shutdown_tx);
        self.pump_task = Some(tokio::spawn(pump.run(shutdown_rx)));
        info!("tunneling started");
        Ok(())
    }

    /// Tear everything down. Idempotent; the session ends in `Stopped`.
    pub async fn stop(&mut self) {
        self.stop_with(None).await;
    }

    async fn stop_with(&mut self, error: Option<String>) {
        {
            // Keep the first recorded error; later stops are cleanup-only.
            let mut state = self.state.lock().expect("state mutex");
            if !matches!(*state, SessionState::Stopped(_)) {
                *state = SessionState::Stopped(error);
            }
        }

        if let Some(shutdown) = self.pump_shutdown.take() {
            let _ = shutdown.try_send(());
        }
        if let Some(task) = self.pump_task.take() {
            // The pump exits on the shutdown signal; don't wait forever.
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("tunnel pump did not stop in time");
            }
        }
        if let Some(udp) = self.udp.take() {
            udp.shutdown().await;
        }
        self.udp_frames = None;
        self.udp_socket = None;
        if let Some(mut control) = self.control.take() {
            control.shutdown().await;
        }
        if let Some(mut dhcp) = self.dhcp.take() {
            dhcp.stop();
        }
        *self.lease.lock().expect("lease mutex") = None;
        info!("session stopped");
    }

    /// App-message entry point (spec: `dhcp_status` and friends).
    pub fn on_app_message(&self, command: &[u8]) -> Vec<u8> {
        let lease = self.lease.lock().expect("lease mutex");
        handle_app_message(command, lease.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::protocol::handshake::Credential;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;

    struct StaticAuth;

    #[async_trait]
    impl AuthSource for StaticAuth {
        async fn credential(&self) -> Result<Credential> {
            Ok(Credential::Password {
                username: "alice".into(),
                password: "p@ss".into(),
            })
        }
    }

    fn session() -> Session {
        Session::new(SessionConfig::new(Ipv4Addr::new(198, 51, 100, 7), 443, "H"))
    }

    #[test]
    fn new_session_is_idle_with_local_unicast_mac() {
        let session = session();
        assert_eq!(session.state(), SessionState::Idle);
        let mac = session.mac();
        assert_eq!(mac[0] & 0x01, 0);
        assert_eq!(mac[0] & 0x02, 0x02);
    }

    #[tokio::test]
    async fn handshake_requires_connect_first() {
        let mut session = session();
        let err = session.handshake(&StaticAuth).await.unwrap_err();
        assert!(matches!(
            err,
            Error::BadState {
                state: "Idle",
                operation: "handshake"
            }
        ));
    }

    #[tokio::test]
    async fn obtain_ip_requires_established() {
        let mut session = session();
        let err = session.obtain_ip_via_dhcp().await.unwrap_err();
        assert!(matches!(err, Error::BadState { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_terminal() {
        let mut session = session();
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped(None));
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped(None));

        // Nothing is permitted after Stopped.
        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            Error::BadState {
                state: "Stopped",
                operation: "connect"
            }
        ));
        let err = session.handshake(&StaticAuth).await.unwrap_err();
        assert!(matches!(err, Error::BadState { .. }));
    }

    #[tokio::test]
    async fn app_message_without_lease_reports_nulls() {
        let session = session();
        let reply = session.on_app_message(b"dhcp_status");
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["type"], "dhcp_info");
        assert!(value["payload"]["assigned_ip"].is_null());
        assert!(session.on_app_message(b"bogus").is_empty());
    }
}
