//! Embedded DHCP client.
//!
//! Pure state machine: the session lane feeds it decoded Ethernet frames
//! and a 1 Hz tick, and it hands back frames to transmit plus lifecycle
//! events. All timing decisions take `Instant` parameters so the retry and
//! renewal rules are testable without a clock.

use crate::crypto;
use crate::error::DhcpError;
use crate::packet::dhcp::{
    build_broadcast_frame, build_unicast_frame, DhcpMessageType, DhcpReply, DhcpRequestSpec,
};
use crate::packet::ethernet::BROADCAST_MAC;
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Resend spacing within a phase.
const RESEND_INTERVAL: Duration = Duration::from_secs(3);

/// Resends allowed per phase before giving up.
const MAX_RETRIES: u32 = 4;

/// Default MTU reported with the lease.
pub const DEFAULT_MTU: u16 = 1400;

/// Network parameters produced by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParameters {
    pub client_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub mtu: u16,
    pub lease_time: u32,
    pub server_id: Option<Ipv4Addr>,
}

/// Client states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DhcpClientState {
    #[default]
    Idle,
    SendingDiscover,
    WaitingOffer,
    WaitingAck,
    Bound,
    Renewing,
}

/// What the state machine wants the session lane to do.
#[derive(Debug, Clone, PartialEq)]
pub enum DhcpEvent {
    /// Emit this Ethernet frame on the control channel.
    Transmit(Bytes),
    /// Initial lease acquired.
    Bound(NetworkParameters),
    /// Existing lease refreshed.
    Renewed(NetworkParameters),
    /// The exchange is over and failed.
    Failed(DhcpError),
}

#[derive(Debug, Clone)]
struct Lease {
    params: NetworkParameters,
    bound_at: Instant,
}

/// DHCP client state machine.
#[derive(Debug)]
pub struct DhcpClient {
    mac: [u8; 6],
    state: DhcpClientState,
    xid: u32,
    offered_ip: Ipv4Addr,
    server_id: Ipv4Addr,
    retries: u32,
    last_send: Option<Instant>,
    lease: Option<Lease>,
    /// MAC to address unicast renewals to, learned from ARP. Broadcast
    /// until the resolver knows better.
    unicast_mac: [u8; 6],
}

impl DhcpClient {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            state: DhcpClientState::Idle,
            xid: 0,
            offered_ip: Ipv4Addr::UNSPECIFIED,
            server_id: Ipv4Addr::UNSPECIFIED,
            retries: 0,
            last_send: None,
            lease: None,
            unicast_mac: BROADCAST_MAC,
        }
    }

    pub fn state(&self) -> DhcpClientState {
        self.state
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Whether the exchange is still in flight (frames must keep flowing
    /// to this client).
    pub fn is_active(&self) -> bool {
        !matches!(self.state, DhcpClientState::Idle)
    }

    /// Current lease parameters, if bound.
    pub fn lease(&self) -> Option<&NetworkParameters> {
        self.lease.as_ref().map(|l| &l.params)
    }

    /// Hint the MAC for unicast renewals (usually the gateway's).
    pub fn set_unicast_hint(&mut self, mac: [u8; 6]) {
        self.unicast_mac = mac;
    }

    /// Begin a fresh cycle: drop any prior lease, pick a new XID, send
    /// DISCOVER.
    pub fn start(&mut self, now: Instant) -> Vec<DhcpEvent> {
        self.lease = None;
        self.offered_ip = Ipv4Addr::UNSPECIFIED;
        self.server_id = Ipv4Addr::UNSPECIFIED;
        self.xid = crypto::random_nonzero_u32();
        debug!(xid = format_args!("{:08x}", self.xid), "starting DHCP cycle");
        self.send_discover(now)
    }

    /// Reset to idle, clearing all state.
    pub fn stop(&mut self) {
        *self = Self::new(self.mac);
    }

    fn send_discover(&mut self, now: Instant) -> Vec<DhcpEvent> {
        self.state = DhcpClientState::SendingDiscover;
        let frame = build_broadcast_frame(&DhcpRequestSpec::discover(self.xid, self.mac));
        self.state = DhcpClientState::WaitingOffer;
        self.last_send = Some(now);
        vec![DhcpEvent::Transmit(frame)]
    }

    fn send_request(&mut self, now: Instant) -> Vec<DhcpEvent> {
        let frame = build_broadcast_frame(&DhcpRequestSpec::request(
            self.xid,
            self.mac,
            self.offered_ip,
            self.server_id,
        ));
        self.state = DhcpClientState::WaitingAck;
        self.last_send = Some(now);
        vec![DhcpEvent::Transmit(frame)]
    }

    fn send_renewal(&mut self, now: Instant) -> Vec<DhcpEvent> {
        let Some(lease) = self.lease.as_ref() else {
            return Vec::new();
        };
        let Some(server) = lease.params.server_id else {
            return Vec::new();
        };
        let spec = DhcpRequestSpec::renewal(self.xid, self.mac, lease.params.client_ip);
        let frame = build_unicast_frame(&spec, server, self.unicast_mac);
        self.state = DhcpClientState::Renewing;
        self.last_send = Some(now);
        vec![DhcpEvent::Transmit(frame)]
    }

    /// 1 Hz tick: drives resends, phase timeouts, and lease renewal.
    pub fn tick(&mut self, now: Instant) -> Vec<DhcpEvent> {
        match self.state {
            DhcpClientState::WaitingOffer | DhcpClientState::WaitingAck => {
                let due = self
                    .last_send
                    .map_or(true, |t| now.duration_since(t) >= RESEND_INTERVAL);
                if !due {
                    return Vec::new();
                }
                if self.retries >= MAX_RETRIES {
                    warn!(state = ?self.state, "DHCP retry budget exhausted");
                    self.state = DhcpClientState::Idle;
                    return vec![DhcpEvent::Failed(DhcpError::Timeout)];
                }
                self.retries += 1;
                if self.state == DhcpClientState::WaitingOffer {
                    self.send_discover(now)
                } else {
                    self.send_request(now)
                }
            }
            DhcpClientState::Renewing => {
                let due = self
                    .last_send
                    .map_or(true, |t| now.duration_since(t) >= RESEND_INTERVAL);
                if !due {
                    return Vec::new();
                }
                if self.retries >= MAX_RETRIES {
                    // A failed renewal keeps the lease; try again later.
                    debug!("renewal attempts exhausted, returning to Bound");
                    self.retries = 0;
                    self.state = DhcpClientState::Bound;
                    return Vec::new();
                }
                self.retries += 1;
                self.send_renewal(now)
            }
            DhcpClientState::Bound => {
                let Some(lease) = self.lease.as_ref() else {
                    return Vec::new();
                };
                if lease.params.lease_time == 0 {
                    return Vec::new();
                }
                let t1 = Duration::from_secs(u64::from(lease.params.lease_time) / 2);
                if now.duration_since(lease.bound_at) >= t1 {
                    info!("DHCP lease at T1, renewing");
                    self.retries = 0;
                    self.xid = crypto::random_nonzero_u32();
                    self.send_renewal(now)
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Feed one decoded Ethernet frame. Non-DHCP frames are ignored.
    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Vec<DhcpEvent> {
        let Some(reply) = DhcpReply::from_ethernet(frame) else {
            return Vec::new();
        };
        if reply.xid != self.xid {
            debug!(
                got = format_args!("{:08x}", reply.xid),
                want = format_args!("{:08x}", self.xid),
                "DHCP XID mismatch"
            );
            return Vec::new();
        }

        match (reply.msg_type, self.state) {
            (Some(DhcpMessageType::Offer), DhcpClientState::WaitingOffer) => {
                let Some(server_id) = reply.server_id else {
                    return vec![DhcpEvent::Failed(DhcpError::InvalidMessage(
                        "OFFER without server identifier".into(),
                    ))];
                };
                self.offered_ip = reply.yiaddr;
                self.server_id = server_id;
                self.retries = 0;
                info!(ip = %reply.yiaddr, server = %server_id, "DHCP OFFER");
                self.send_request(now)
            }
            (Some(DhcpMessageType::Ack), DhcpClientState::WaitingAck)
            | (Some(DhcpMessageType::Ack), DhcpClientState::Renewing) => {
                let renewing = self.state == DhcpClientState::Renewing;
                if reply.yiaddr.is_unspecified() {
                    return vec![DhcpEvent::Failed(DhcpError::IncompleteConfig(
                        "ACK without yiaddr".into(),
                    ))];
                }
                let Some(mask) = reply.subnet_mask else {
                    return vec![DhcpEvent::Failed(DhcpError::IncompleteConfig(
                        "ACK without subnet mask".into(),
                    ))];
                };
                let params = NetworkParameters {
                    client_ip: reply.yiaddr,
                    subnet_mask: mask,
                    gateway: reply.router,
                    dns_servers: reply.dns_servers.clone(),
                    mtu: DEFAULT_MTU,
                    lease_time: reply.lease_time,
                    server_id: reply.server_id.or(Some(self.server_id)).filter(|ip| !ip.is_unspecified()),
                };
                self.lease = Some(Lease {
                    params: params.clone(),
                    bound_at: now,
                });
                self.state = DhcpClientState::Bound;
                self.retries = 0;
                info!(ip = %params.client_ip, mask = %params.subnet_mask, renewing, "DHCP bound");
                if renewing {
                    vec![DhcpEvent::Renewed(params)]
                } else {
                    vec![DhcpEvent::Bound(params)]
                }
            }
            (Some(DhcpMessageType::Nak), DhcpClientState::WaitingAck)
            | (Some(DhcpMessageType::Nak), DhcpClientState::Renewing) => {
                warn!("DHCP NAK, restarting from DISCOVER");
                let mut events = vec![DhcpEvent::Failed(DhcpError::Nak)];
                self.retries = 0;
                events.extend(self.start(now));
                events
            }
            _ => Vec::new(),
        }
    }
}
