//! The tunneling actor: a single task that serializes all session-lane
//! work while the data plane is up.
//!
//! One `select!` loop owns the control channel, the stream framer, the
//! DHCP client (for renewals), the ARP resolver, and the host flow. The
//! UDP lane stays in its own task and crosses over only through channels.

use crate::error::Error;
use crate::flow::{FlowProtocol, HostFlow};
use crate::net::connection::ControlChannel;
use crate::net::udp_accel::UdpHandle;
use crate::packet::ethernet::{build_frame, EtherType, EthernetFrame, ZERO_MAC};
use crate::packet::ipv4::{is_on_link, Ipv4Packet};
use crate::protocol::framer::{encode_frame, encode_keepalive, StreamFramer};
use crate::session::{SessionState, SharedLease, SharedState};
use crate::tunnel::arp_resolver::ArpResolver;
use crate::tunnel::dhcp_client::{DhcpClient, DhcpEvent};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// TCP keep-alive spacing bounds.
const TCP_KEEPALIVE_MIN_MS: u64 = 10_000;
const TCP_KEEPALIVE_MAX_MS: u64 = 20_000;

/// Keep-alive padding bound (exclusive).
const TCP_KEEPALIVE_MAX_PADDING: usize = 512;

/// Frame counters for diagnostics.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub tcp_frames_sent: AtomicU64,
    pub udp_frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
}

/// Next-hop selection: on-link destinations are ARPed directly, anything
/// else goes through the gateway. `None` means unroutable.
fn next_hop(
    dst: std::net::Ipv4Addr,
    my_ip: std::net::Ipv4Addr,
    mask: std::net::Ipv4Addr,
    gateway: Option<std::net::Ipv4Addr>,
) -> Option<std::net::Ipv4Addr> {
    if is_on_link(dst, my_ip, mask) {
        Some(dst)
    } else {
        gateway
    }
}

fn keepalive_spacing() -> Duration {
    use rand::Rng;
    Duration::from_millis(
        rand::thread_rng().gen_range(TCP_KEEPALIVE_MIN_MS..TCP_KEEPALIVE_MAX_MS),
    )
}

fn keepalive_padding() -> usize {
    use rand::Rng;
    rand::thread_rng().gen_range(0..TCP_KEEPALIVE_MAX_PADDING)
}

/// Everything the tunneling actor owns.
pub(crate) struct TunnelPump {
    pub control: ControlChannel,
    pub framer: StreamFramer,
    pub dhcp: DhcpClient,
    pub arp: ArpResolver,
    pub flow: Arc<dyn HostFlow>,
    pub udp: Option<UdpHandle>,
    pub udp_frames: Option<mpsc::Receiver<Bytes>>,
    pub mac: [u8; 6],
    pub shared_state: SharedState,
    pub shared_lease: SharedLease,
    pub stats: Arc<SessionStats>,
    /// Bytes that arrived behind the Welcome body.
    pub initial_buffered: Bytes,
}

impl TunnelPump {
    pub(crate) async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        // Announce ourselves and look up the gateway before pumping.
        let now = Instant::now();
        let my_ip = self.lease_ip();
        for frame in self.arp.start(my_ip, now) {
            self.send_frame(frame).await;
        }
        if let Some(gateway) = self.gateway() {
            if let Some(request) = self.arp.request(gateway, now) {
                self.send_frame(request).await;
            }
        }

        // Tunnel bytes that were already buffered behind the handshake.
        let seed = std::mem::take(&mut self.initial_buffered);
        if !seed.is_empty() {
            self.on_control_bytes(&seed).await;
        }

        let mut second_tick = tokio::time::interval(Duration::from_secs(1));
        second_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ka_deadline = tokio::time::Instant::now() + keepalive_spacing();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("tunnel pump shutting down");
                    break;
                }
                received = self.control.receive() => match received {
                    Ok(chunk) => self.on_control_bytes(&chunk).await,
                    Err(Error::TransportClosed) => {
                        warn!("server closed the control channel");
                        self.fail("control transport closed").await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "control channel read failed");
                        self.fail(&e.to_string()).await;
                        break;
                    }
                },
                frame = recv_udp(&mut self.udp_frames) => {
                    match frame {
                        Some(frame) => {
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            self.classify_inbound(frame).await;
                        }
                        // Lane gone; stop polling its channel.
                        None => self.udp_frames = None,
                    }
                }
                batch = self.flow.read_packets() => match batch {
                    Ok(packets) => {
                        for (packet, protocol) in packets {
                            self.route_outbound(packet, protocol).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "host flow read failed");
                        self.fail(&e.to_string()).await;
                        break;
                    }
                },
                _ = second_tick.tick() => self.on_second_tick().await,
                _ = tokio::time::sleep_until(ka_deadline) => {
                    let ka = encode_keepalive(keepalive_padding());
                    if let Err(e) = self.control.send(&ka).await {
                        warn!(error = %e, "TCP keep-alive send failed");
                        self.fail(&e.to_string()).await;
                        break;
                    }
                    trace!("TCP keep-alive sent");
                    ka_deadline = tokio::time::Instant::now() + keepalive_spacing();
                }
            }
        }

        if let Some(udp) = &self.udp {
            udp.shutdown().await;
        }
        self.control.shutdown().await;
        self.arp.stop();
        info!("tunnel pump stopped");
    }

    fn lease_ip(&self) -> std::net::Ipv4Addr {
        self.shared_lease
            .lock()
            .expect("lease mutex")
            .as_ref()
            .map(|l| l.client_ip)
            .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED)
    }

    fn gateway(&self) -> Option<std::net::Ipv4Addr> {
        self.shared_lease
            .lock()
            .expect("lease mutex")
            .as_ref()
            .and_then(|l| l.gateway)
    }

    fn subnet(&self) -> (std::net::Ipv4Addr, std::net::Ipv4Addr) {
        let guard = self.shared_lease.lock().expect("lease mutex");
        match guard.as_ref() {
            Some(l) => (l.client_ip, l.subnet_mask),
            None => (
                std::net::Ipv4Addr::UNSPECIFIED,
                std::net::Ipv4Addr::UNSPECIFIED,
            ),
        }
    }

    async fn fail(&mut self, reason: &str) {
        let mut state = self.shared_state.lock().expect("state mutex");
        if !matches!(*state, SessionState::Stopped(_)) {
            *state = SessionState::Stopped(Some(reason.to_string()));
        }
    }

    /// Emit one Ethernet frame on the data plane: UDP when the window is
    /// open and an endpoint is pinned, TCP otherwise.
    async fn send_frame(&mut self, frame: Bytes) {
        if let Some(udp) = &self.udp {
            if udp.is_ready() && udp.try_send_frame(frame.clone()) {
                self.stats.udp_frames_sent.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = self.control.send(&encode_frame(&frame)).await {
            debug!(error = %e, "TCP frame send failed");
            return;
        }
        self.stats.tcp_frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    async fn on_control_bytes(&mut self, chunk: &[u8]) {
        let mut frames = Vec::new();
        if let Err(e) = self.framer.feed(chunk, &mut frames) {
            // One bad frame is noise; the framer state is still aligned to
            // the next header.
            debug!(error = %e, "stream framer rejected input");
            return;
        }
        for frame in frames {
            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
            self.classify_inbound(frame).await;
        }
    }

    /// Dispatch one decoded Ethernet frame.
    async fn classify_inbound(&mut self, frame: Bytes) {
        let now = Instant::now();

        // The DHCP client sees every frame while a lease is active so
        // renewals and NAKs are handled wherever they arrive.
        if self.dhcp.is_active() {
            let events = self.dhcp.handle_frame(&frame, now);
            self.process_dhcp_events(events).await;
        }

        let Some(eth) = EthernetFrame::parse(&frame) else {
            trace!(len = frame.len(), "runt frame dropped");
            return;
        };
        match eth.kind() {
            Some(EtherType::Arp) => {
                let payload = frame.slice(14..);
                if let Some(reply) = self.arp.on_incoming(&payload, now) {
                    self.send_frame(reply).await;
                }
            }
            Some(EtherType::Ipv4) => {
                let packet = frame.slice(14..);
                if let Err(e) = self
                    .flow
                    .write_packets(vec![(packet, FlowProtocol::Ipv4)])
                    .await
                {
                    debug!(error = %e, "host flow write failed");
                }
            }
            Some(EtherType::Ipv6) => {
                let packet = frame.slice(14..);
                if let Err(e) = self
                    .flow
                    .write_packets(vec![(packet, FlowProtocol::Ipv6)])
                    .await
                {
                    debug!(error = %e, "host flow write failed");
                }
            }
            None => trace!(ethertype = eth.ethertype, "unhandled ethertype"),
        }
    }

    /// Route one outbound IP packet from the host.
    async fn route_outbound(&mut self, packet: Bytes, protocol: FlowProtocol) {
        let now = Instant::now();
        match protocol {
            FlowProtocol::Ipv4 => {
                let Some(dst) = Ipv4Packet::destination(&packet) else {
                    trace!("unroutable outbound packet dropped");
                    return;
                };
                let (my_ip, mask) = self.subnet();
                let Some(target) = next_hop(dst, my_ip, mask, self.gateway()) else {
                    trace!(%dst, "off-link destination without gateway, dropped");
                    return;
                };

                let dst_mac = match self.arp.resolve(target, now) {
                    Some(mac) => mac,
                    None => {
                        // Ask, and still emit best-effort with a zero MAC.
                        if let Some(request) = self.arp.request(target, now) {
                            self.send_frame(request).await;
                        }
                        ZERO_MAC
                    }
                };
                let frame = build_frame(&dst_mac, &self.mac, EtherType::Ipv4, &packet);
                self.send_frame(frame).await;
            }
            FlowProtocol::Ipv6 => {
                // Forwarded opaquely when the gateway MAC is known.
                let gw_mac = self
                    .gateway()
                    .and_then(|gw| self.arp.resolve(gw, now));
                match gw_mac {
                    Some(mac) => {
                        let frame = build_frame(&mac, &self.mac, EtherType::Ipv6, &packet);
                        self.send_frame(frame).await;
                    }
                    None => trace!("IPv6 packet dropped, no next-hop MAC"),
                }
            }
        }
    }

    async fn on_second_tick(&mut self) {
        let now = Instant::now();

        // Keep the DHCP renewal path aimed at the gateway's MAC.
        if let Some(gateway) = self.gateway() {
            if let Some(mac) = self.arp.resolve(gateway, now) {
                self.dhcp.set_unicast_hint(mac);
            } else if let Some(request) = self.arp.request(gateway, now) {
                self.send_frame(request).await;
            }
        }

        let events = self.dhcp.tick(now);
        self.process_dhcp_events(events).await;

        for frame in self.arp.tick(now) {
            self.send_frame(frame).await;
        }
    }

    async fn process_dhcp_events(&mut self, events: Vec<DhcpEvent>) {
        for event in events {
            match event {
                DhcpEvent::Transmit(frame) => self.send_frame(frame).await,
                DhcpEvent::Renewed(params) | DhcpEvent::Bound(params) => {
                    info!(ip = %params.client_ip, "lease refreshed");
                    *self.shared_lease.lock().expect("lease mutex") = Some(params);
                }
                DhcpEvent::Failed(e) => {
                    // Renewal failures are not session-fatal; the lease
                    // stays until it actually lapses.
                    debug!(error = %e, "DHCP event during tunneling");
                }
            }
        }
    }
}

async fn recv_udp(frames: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
