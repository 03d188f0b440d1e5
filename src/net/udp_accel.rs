//! UDP acceleration engine, protocol version 2.
//!
//! Carries Ethernet frames in ChaCha20-Poly1305 boxes alongside the TCP
//! control channel. Wire format:
//!
//! ```text
//! [nonce:12] [ciphertext] [tag:16]
//! plaintext: [cookie:u32] [my_tick:u64] [your_tick:u64] [size:u16] [flag:u8] [payload]
//! ```
//!
//! The lane task owns the socket, the crypto boxes, the readiness tracker
//! and the endpoint book; everything else talks to it through the handle.

use crate::crypto;
use crate::error::{Error, Result};
use crate::net::readiness::{EndpointBook, ReadinessTracker, RecvVerdict};
use crate::protocol::handshake::{UdpAccelAdvertisement, UdpAccelParams};
use bytes::{Buf, BufMut, Bytes};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Nonce length.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Inner header: cookie + my_tick + your_tick + size + flag.
pub const INNER_HEADER_LEN: usize = 4 + 8 + 8 + 2 + 1;

/// Smallest valid wire packet (empty payload).
pub const MIN_WIRE_LEN: usize = NONCE_LEN + INNER_HEADER_LEN + TAG_LEN;

/// Client v2 key length; the first 32 bytes feed ChaCha20-Poly1305.
pub const CLIENT_KEY_V2_LEN: usize = 128;

/// AEAD key length actually used from either v2 key.
pub const AEAD_KEY_LEN: usize = 32;

/// Receive buffer size.
const RECV_BUF_LEN: usize = 2048;

/// Keep-alive base cadence.
const KEEPALIVE_BASE_MS: u64 = 1500;
const KEEPALIVE_BASE_FAST_MS: u64 = 700;
const KEEPALIVE_JITTER_MS: u64 = 800;

/// Minimum spacing of keep-alive ACKs triggered by inbound keep-alives.
const ACK_MIN_INTERVAL_MS: u64 = 250;

/// Decrypted inner packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainPacket {
    pub cookie: u32,
    pub my_tick: u64,
    pub your_tick: u64,
    pub flag: u8,
    pub payload: Vec<u8>,
}

/// Sealing box with the evolving nonce.
pub struct PacketSealer {
    key: LessSafeKey,
    next_nonce: [u8; NONCE_LEN],
}

impl PacketSealer {
    pub fn new(key_material: &[u8]) -> Result<Self> {
        if key_material.len() < AEAD_KEY_LEN {
            return Err(Error::handshake("UDP send key too short"));
        }
        let key = UnboundKey::new(&CHACHA20_POLY1305, &key_material[..AEAD_KEY_LEN])
            .map_err(|_| Error::handshake("bad UDP send key"))?;
        Ok(Self {
            key: LessSafeKey::new(key),
            next_nonce: crypto::random_bytes(),
        })
    }

    /// Seal one packet. The next nonce is the first 12 bytes of this
    /// ciphertext when it is long enough, otherwise the current nonce
    /// incremented as a 96-bit big-endian counter.
    pub fn seal(
        &mut self,
        cookie: u32,
        my_tick: u64,
        your_tick: u64,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let mut inner = Vec::with_capacity(INNER_HEADER_LEN + payload.len());
        inner.put_u32(cookie);
        inner.put_u64(my_tick);
        inner.put_u64(your_tick);
        inner.put_u16(payload.len() as u16);
        inner.put_u8(0); // flag: no compression
        inner.extend_from_slice(payload);

        let nonce_bytes = self.next_nonce;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut inner)
            .map_err(|_| Error::pack("UDP seal failed"))?;

        let mut wire = Vec::with_capacity(NONCE_LEN + inner.len() + TAG_LEN);
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&inner);
        wire.extend_from_slice(tag.as_ref());

        if inner.len() >= NONCE_LEN {
            self.next_nonce.copy_from_slice(&inner[..NONCE_LEN]);
        } else {
            increment_nonce(&mut self.next_nonce);
        }

        Ok(wire)
    }
}

/// Opening box; the nonce comes from the wire prefix.
pub struct PacketOpener {
    key: LessSafeKey,
}

impl PacketOpener {
    pub fn new(key_material: &[u8]) -> Result<Self> {
        if key_material.len() < AEAD_KEY_LEN {
            return Err(Error::handshake("UDP receive key too short"));
        }
        let key = UnboundKey::new(&CHACHA20_POLY1305, &key_material[..AEAD_KEY_LEN])
            .map_err(|_| Error::handshake("bad UDP receive key"))?;
        Ok(Self {
            key: LessSafeKey::new(key),
        })
    }

    /// Decrypt and parse one datagram. Anything malformed is `None`;
    /// datagram noise never errors the session.
    pub fn open(&self, wire: &[u8]) -> Option<PlainPacket> {
        if wire.len() < MIN_WIRE_LEN {
            return None;
        }
        let nonce = Nonce::try_assume_unique_for_key(&wire[..NONCE_LEN]).ok()?;
        let mut in_out = wire[NONCE_LEN..].to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .ok()?;

        let mut cursor = &plain[..];
        if cursor.len() < INNER_HEADER_LEN {
            return None;
        }
        let cookie = cursor.get_u32();
        let my_tick = cursor.get_u64();
        let your_tick = cursor.get_u64();
        let size = cursor.get_u16() as usize;
        let flag = cursor.get_u8();
        if cursor.len() < size {
            return None;
        }
        Some(PlainPacket {
            cookie,
            my_tick,
            your_tick,
            flag,
            payload: cursor[..size].to_vec(),
        })
    }
}

/// 96-bit big-endian increment.
fn increment_nonce(nonce: &mut [u8; NONCE_LEN]) {
    for byte in nonce.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

/// Keep-alive delay: `base + rand(0..800)` ms.
fn keepalive_delay(fast_detect: bool) -> Duration {
    use rand::Rng;
    let base = if fast_detect {
        KEEPALIVE_BASE_FAST_MS
    } else {
        KEEPALIVE_BASE_MS
    };
    Duration::from_millis(base + rand::thread_rng().gen_range(0..KEEPALIVE_JITTER_MS))
}

/// The bound, address-observed UDP socket plus the client key material
/// advertised during Auth.
pub struct UdpAccelSocket {
    socket: UdpSocket,
    local: SocketAddrV4,
    client_key_v1: [u8; 20],
    client_key_v2: [u8; CLIENT_KEY_V2_LEN],
}

impl UdpAccelSocket {
    /// Bind `0.0.0.0:0`, observe the kernel-chosen local address via a
    /// transient connect to the control peer, then dissolve the
    /// association so datagrams from any source are accepted.
    pub fn bind(control_peer: SocketAddrV4) -> Result<Self> {
        let std_socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_socket.connect(control_peer)?;
        let local = match std_socket.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(Error::connect("UDP socket bound to an IPv6 address"));
            }
        };
        disconnect(&std_socket)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        debug!(local = %local, "UDP acceleration socket bound");
        Ok(Self {
            socket,
            local,
            client_key_v1: crypto::random_bytes(),
            client_key_v2: crypto::random_bytes(),
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Client half of the Auth advertisement.
    pub fn advertisement(&self) -> UdpAccelAdvertisement {
        let client_ip = if self.local.ip().is_loopback() {
            Ipv4Addr::UNSPECIFIED
        } else {
            *self.local.ip()
        };
        UdpAccelAdvertisement {
            client_ip,
            client_port: self.local.port(),
            client_key_v1: self.client_key_v1,
            client_key_v2: self.client_key_v2,
        }
    }
}

/// Dissolve a UDP association with an `AF_UNSPEC` connect.
#[cfg(unix)]
fn disconnect(socket: &std::net::UdpSocket) -> Result<()> {
    use std::os::fd::AsRawFd;
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_UNSPEC as libc::sa_family_t;
    let rc = unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Some kernels report EAFNOSUPPORT for a successful dissolve.
        if err.raw_os_error() != Some(libc::EAFNOSUPPORT) {
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn disconnect(_socket: &std::net::UdpSocket) -> Result<()> {
    Ok(())
}

/// Commands into the UDP lane.
enum UdpCommand {
    SendFrame(Bytes),
    Shutdown,
}

/// Handle held by the session lane.
#[derive(Clone)]
pub struct UdpHandle {
    cmd_tx: mpsc::Sender<UdpCommand>,
    ready_rx: watch::Receiver<bool>,
    local: SocketAddrV4,
}

impl UdpHandle {
    /// Whether the data path is currently usable, as last published by
    /// the lane.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Queue an Ethernet frame for the accelerated path. Returns false
    /// when the lane is gone or saturated; the caller falls back to TCP.
    pub fn try_send_frame(&self, frame: Bytes) -> bool {
        self.cmd_tx.try_send(UdpCommand::SendFrame(frame)).is_ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(UdpCommand::Shutdown).await;
    }
}

/// Spawn the UDP lane for a negotiated acceleration session.
///
/// `control_ip` is the TCP control peer; when the Welcome advertised a
/// different server address, the control peer becomes a fallback
/// destination. Decoded Ethernet frames arrive on `frame_tx`; readiness
/// is published through the handle.
pub fn spawn(
    socket: UdpAccelSocket,
    params: &UdpAccelParams,
    control_ip: Ipv4Addr,
    frame_tx: mpsc::Sender<Bytes>,
) -> Result<UdpHandle> {
    if params.server_key_v2.len() < AEAD_KEY_LEN {
        return Err(Error::handshake("UDP acceleration v2 key too short"));
    }

    let sealer = PacketSealer::new(&socket.client_key_v2)?;
    let opener = PacketOpener::new(&params.server_key_v2)?;
    let configured = SocketAddrV4::new(params.server_ip, params.server_port);
    let mut endpoints = EndpointBook::new(configured);
    if params.server_ip != control_ip {
        endpoints.set_reported(SocketAddrV4::new(control_ip, params.server_port));
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (ready_tx, ready_rx) = watch::channel(false);
    let local = socket.local_addr();

    let lane = UdpLane {
        socket: socket.socket,
        sealer,
        opener,
        tracker: ReadinessTracker::new(params.fast_disconnect_detect),
        endpoints,
        server_cookie: params.server_cookie,
        client_cookie: params.client_cookie,
        fast_detect: params.fast_disconnect_detect,
        started: Instant::now(),
        last_ack_ms: 0,
        ready_tx,
        frame_tx,
    };

    info!(server = %configured, fast_detect = params.fast_disconnect_detect,
        "starting UDP acceleration lane");
    tokio::spawn(lane.run(cmd_rx));

    Ok(UdpHandle {
        cmd_tx,
        ready_rx,
        local,
    })
}

/// State owned exclusively by the UDP lane task.
struct UdpLane {
    socket: UdpSocket,
    sealer: PacketSealer,
    opener: PacketOpener,
    tracker: ReadinessTracker,
    endpoints: EndpointBook,
    /// Embedded in every outgoing packet.
    server_cookie: u32,
    /// Required on every incoming packet.
    client_cookie: u32,
    fast_detect: bool,
    started: Instant,
    last_ack_ms: u64,
    ready_tx: watch::Sender<bool>,
    frame_tx: mpsc::Sender<Bytes>,
}

impl UdpLane {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<UdpCommand>) {
        let mut recv_buf = vec![0u8; RECV_BUF_LEN];
        let mut ka_deadline = tokio::time::Instant::now() + keepalive_delay(self.fast_detect);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(UdpCommand::SendFrame(frame)) => self.send_data(&frame).await,
                    Some(UdpCommand::Shutdown) | None => break,
                },
                received = self.socket.recv_from(&mut recv_buf) => match received {
                    Ok((len, SocketAddr::V4(src))) => {
                        let wire = recv_buf[..len].to_vec();
                        self.on_datagram(&wire, src).await;
                    }
                    Ok((_, SocketAddr::V6(src))) => {
                        trace!(%src, "ignoring IPv6 datagram");
                    }
                    Err(e) => {
                        warn!(error = %e, "UDP receive error");
                    }
                },
                _ = tokio::time::sleep_until(ka_deadline) => {
                    self.send_keepalives().await;
                    ka_deadline = tokio::time::Instant::now()
                        + keepalive_delay(self.fast_detect);
                }
            }
            self.publish_ready();
        }
        debug!("UDP acceleration lane stopped");
    }

    fn now_ms(&self) -> u64 {
        let elapsed = self.started.elapsed().as_millis() as u64;
        elapsed.max(1)
    }

    fn publish_ready(&mut self) {
        let now = self.now_ms();
        let ready = self.tracker.is_ready(true, now) && self.endpoints.pinned().is_some();
        self.ready_tx.send_if_modified(|current| {
            if *current != ready {
                info!(ready, "UDP data path readiness changed");
                *current = ready;
                true
            } else {
                false
            }
        });
    }

    async fn send_data(&mut self, frame: &[u8]) {
        let now = self.now_ms();
        if !self.tracker.is_ready(true, now) || self.endpoints.pinned().is_none() {
            trace!("data send while not ready, dropping (TCP carries it)");
            return;
        }
        let destination = self.endpoints.primary();
        self.send_packet(frame, destination).await;
    }

    async fn send_packet(&mut self, payload: &[u8], destination: SocketAddrV4) {
        let my_tick = self.now_ms();
        let your_tick = self.tracker.peer_tick();
        match self
            .sealer
            .seal(self.server_cookie, my_tick, your_tick, payload)
        {
            Ok(wire) => {
                if let Err(e) = self.socket.send_to(&wire, destination).await {
                    trace!(error = %e, %destination, "UDP send failed");
                }
            }
            Err(e) => warn!(error = %e, "UDP seal failed"),
        }
    }

    async fn send_keepalives(&mut self) {
        let primary = self.endpoints.primary();
        self.send_packet(&[], primary).await;

        let now = self.now_ms();
        if !self.tracker.is_ready(true, now) {
            for destination in self.endpoints.fallbacks() {
                self.send_packet(&[], destination).await;
            }
        }
    }

    async fn on_datagram(&mut self, wire: &[u8], src: SocketAddrV4) {
        let Some(packet) = self.opener.open(wire) else {
            trace!(%src, len = wire.len(), "undecryptable datagram");
            return;
        };
        if packet.cookie != self.client_cookie {
            trace!(%src, "datagram with wrong cookie");
            return;
        }

        let now = self.now_ms();
        match self.tracker.on_packet(packet.my_tick, packet.your_tick, now) {
            RecvVerdict::Stale => {
                trace!(%src, tick = packet.my_tick, "stale datagram dropped");
                return;
            }
            RecvVerdict::Accepted => {}
        }

        if self.tracker.may_pin_endpoint() {
            if self.endpoints.differs_from_pinned(src) {
                debug!(%src, "pinning datagram source endpoint");
            }
            self.endpoints.pin(src);
            self.tracker.mark_endpoint_pinned();
        }

        if packet.payload.is_empty() {
            // Peer keep-alive: answer promptly so its own window stays
            // open, but no more than once per interval.
            if now >= self.last_ack_ms + ACK_MIN_INTERVAL_MS {
                self.last_ack_ms = now;
                let destination = self.endpoints.primary();
                self.send_packet(&[], destination).await;
            }
            return;
        }

        if self.frame_tx.send(Bytes::from(packet.payload)).await.is_err() {
            trace!("session lane gone, dropping decoded frame");
        }
    }
}
