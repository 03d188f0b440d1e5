//! ARP resolver and cache.
//!
//! Owned by the session lane. Resolution results steer the next-hop MAC
//! for outbound frames; incoming requests for our address are answered so
//! the server's L2 table stays warm, helped along by a periodic gratuitous
//! announcement.

use crate::packet::arp::{ArpOp, ArpPacket};
use crate::packet::ethernet::{build_frame, EtherType, BROADCAST_MAC};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Cache entry lifetime.
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Spacing between retries of one unresolved address.
const REQUEST_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Requests per unresolved address before giving up.
const MAX_REQUEST_ATTEMPTS: u32 = 4;

/// Gratuitous announcement interval.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    mac: [u8; 6],
    refreshed_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    attempts: u32,
    last_sent: Instant,
}

/// ARP resolver state.
#[derive(Debug)]
pub struct ArpResolver {
    mac: [u8; 6],
    my_ip: Ipv4Addr,
    cache: HashMap<Ipv4Addr, CacheEntry>,
    pending: HashMap<Ipv4Addr, PendingRequest>,
    last_announce: Option<Instant>,
    running: bool,
}

impl ArpResolver {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            my_ip: Ipv4Addr::UNSPECIFIED,
            cache: HashMap::new(),
            pending: HashMap::new(),
            last_announce: None,
            running: false,
        }
    }

    /// Begin announcing `my_ip`. Returns frames to transmit immediately
    /// (the first gratuitous announcement).
    pub fn start(&mut self, my_ip: Ipv4Addr, now: Instant) -> Vec<Bytes> {
        self.my_ip = my_ip;
        self.running = true;
        self.cache.clear();
        self.pending.clear();
        self.last_announce = Some(now);
        debug!(ip = %my_ip, "ARP resolver started");
        vec![self.gratuitous_frame()]
    }

    /// Stop and clear all state.
    pub fn stop(&mut self) {
        self.running = false;
        self.my_ip = Ipv4Addr::UNSPECIFIED;
        self.cache.clear();
        self.pending.clear();
        self.last_announce = None;
    }

    /// Look up a MAC; expired entries are treated as absent.
    pub fn resolve(&self, ip: Ipv4Addr, now: Instant) -> Option<[u8; 6]> {
        self.cache
            .get(&ip)
            .filter(|e| now.duration_since(e.refreshed_at) < CACHE_TTL)
            .map(|e| e.mac)
    }

    /// Ask for `ip`. Idempotent: an in-flight request is only repeated
    /// after its retry interval, and the attempt count is capped. Returns
    /// a request frame when one should go out now.
    pub fn request(&mut self, ip: Ipv4Addr, now: Instant) -> Option<Bytes> {
        if !self.running || ip.is_unspecified() {
            return None;
        }
        match self.pending.get_mut(&ip) {
            Some(pending) => {
                if pending.attempts >= MAX_REQUEST_ATTEMPTS
                    || now.duration_since(pending.last_sent) < REQUEST_RETRY_INTERVAL
                {
                    return None;
                }
                pending.attempts += 1;
                pending.last_sent = now;
            }
            None => {
                self.pending.insert(
                    ip,
                    PendingRequest {
                        attempts: 1,
                        last_sent: now,
                    },
                );
            }
        }
        trace!(target_ip = %ip, "sending ARP request");
        let payload = ArpPacket::request(self.mac, self.my_ip, ip).encode();
        Some(build_frame(&BROADCAST_MAC, &self.mac, EtherType::Arp, &payload))
    }

    /// Handle an incoming ARP payload (after the Ethernet header).
    /// Returns a reply frame when the peer asked for our address.
    pub fn on_incoming(&mut self, payload: &[u8], now: Instant) -> Option<Bytes> {
        let packet = ArpPacket::decode(payload)?;
        match packet.op {
            ArpOp::Reply => {
                trace!(sender = %packet.sender_ip, "ARP reply");
                self.learn(packet.sender_ip, packet.sender_mac, now);
                None
            }
            ArpOp::Request => {
                // Requests still teach us the sender's mapping.
                self.learn(packet.sender_ip, packet.sender_mac, now);
                if !self.running || packet.target_ip != self.my_ip || self.my_ip.is_unspecified() {
                    return None;
                }
                debug!(from = %packet.sender_ip, "answering ARP request for our address");
                let reply = ArpPacket::reply(
                    self.mac,
                    self.my_ip,
                    packet.sender_mac,
                    packet.sender_ip,
                )
                .encode();
                Some(build_frame(
                    &packet.sender_mac,
                    &self.mac,
                    EtherType::Arp,
                    &reply,
                ))
            }
        }
    }

    /// Periodic work: gratuitous announcement every 30 s.
    pub fn tick(&mut self, now: Instant) -> Vec<Bytes> {
        if !self.running {
            return Vec::new();
        }
        let due = self
            .last_announce
            .map_or(true, |t| now.duration_since(t) >= ANNOUNCE_INTERVAL);
        if due {
            self.last_announce = Some(now);
            vec![self.gratuitous_frame()]
        } else {
            Vec::new()
        }
    }

    fn learn(&mut self, ip: Ipv4Addr, mac: [u8; 6], now: Instant) {
        if ip.is_unspecified() {
            return;
        }
        self.pending.remove(&ip);
        self.cache.insert(
            ip,
            CacheEntry {
                mac,
                refreshed_at: now,
            },
        );
    }

    fn gratuitous_frame(&self) -> Bytes {
        let payload = ArpPacket::gratuitous(self.mac, self.my_ip).encode();
        build_frame(&BROADCAST_MAC, &self.mac, EtherType::Arp, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ethernet::EthernetFrame;

    const MY_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const PEER_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x06];

    fn my_ip() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 5)
    }

    fn started(now: Instant) -> ArpResolver {
        let mut resolver = ArpResolver::new(MY_MAC);
        resolver.start(my_ip(), now);
        resolver
    }

    #[test]
    fn start_emits_gratuitous_announcement() {
        let now = Instant::now();
        let mut resolver = ArpResolver::new(MY_MAC);
        let frames = resolver.start(my_ip(), now);
        assert_eq!(frames.len(), 1);
        let eth = EthernetFrame::parse(&frames[0]).unwrap();
        assert_eq!(eth.dst, BROADCAST_MAC);
        assert_eq!(eth.kind(), Some(EtherType::Arp));
        let arp = ArpPacket::decode(eth.payload).unwrap();
        assert_eq!(arp.op, ArpOp::Reply);
        assert_eq!(arp.sender_ip, my_ip());
        assert_eq!(arp.target_ip, my_ip());
        assert_eq!(arp.sender_mac, MY_MAC);
    }

    #[test]
    fn reply_populates_cache_and_expires() {
        let now = Instant::now();
        let mut resolver = started(now);
        let peer = Ipv4Addr::new(10, 0, 0, 9);
        let reply = ArpPacket::reply(PEER_MAC, peer, MY_MAC, my_ip()).encode();
        assert!(resolver.on_incoming(&reply, now).is_none());
        assert_eq!(resolver.resolve(peer, now), Some(PEER_MAC));
        // Fresh within TTL
        assert_eq!(
            resolver.resolve(peer, now + Duration::from_secs(59)),
            Some(PEER_MAC)
        );
        // Expired at TTL
        assert_eq!(resolver.resolve(peer, now + Duration::from_secs(60)), None);
    }

    #[test]
    fn request_for_our_ip_is_answered() {
        let now = Instant::now();
        let mut resolver = started(now);
        let request = ArpPacket::request(PEER_MAC, Ipv4Addr::new(10, 0, 0, 9), my_ip()).encode();
        let reply_frame = resolver.on_incoming(&request, now).expect("must answer");

        let eth = EthernetFrame::parse(&reply_frame).unwrap();
        assert_eq!(eth.dst, PEER_MAC);
        assert_eq!(eth.src, MY_MAC);
        assert_eq!(eth.ethertype, 0x0806);
        let arp = ArpPacket::decode(eth.payload).unwrap();
        assert_eq!(arp.op, ArpOp::Reply);
        assert_eq!(arp.sender_mac, MY_MAC);
        assert_eq!(arp.sender_ip, my_ip());
        assert_eq!(arp.target_mac, PEER_MAC);
        assert_eq!(arp.target_ip, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn request_for_other_ip_not_answered() {
        let now = Instant::now();
        let mut resolver = started(now);
        let request =
            ArpPacket::request(PEER_MAC, Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 7))
                .encode();
        assert!(resolver.on_incoming(&request, now).is_none());
    }

    #[test]
    fn outgoing_requests_rate_limited_and_capped() {
        let start = Instant::now();
        let mut resolver = started(start);
        let target = Ipv4Addr::new(10, 0, 0, 1);

        assert!(resolver.request(target, start).is_some());
        // Immediately again: suppressed.
        assert!(resolver.request(target, start).is_none());
        // After the retry interval: allowed, up to the cap.
        let mut now = start;
        let mut sent = 1;
        for _ in 0..10 {
            now += REQUEST_RETRY_INTERVAL;
            if resolver.request(target, now).is_some() {
                sent += 1;
            }
        }
        assert_eq!(sent, MAX_REQUEST_ATTEMPTS);
    }

    #[test]
    fn reply_clears_pending_so_requests_resume() {
        let start = Instant::now();
        let mut resolver = started(start);
        let target = Ipv4Addr::new(10, 0, 0, 1);
        for i in 0..8 {
            resolver.request(target, start + REQUEST_RETRY_INTERVAL * i);
        }
        let reply = ArpPacket::reply(PEER_MAC, target, MY_MAC, my_ip()).encode();
        let later = start + Duration::from_secs(30);
        resolver.on_incoming(&reply, later);
        assert_eq!(resolver.resolve(target, later), Some(PEER_MAC));

        // Once the entry expires the address can be requested again.
        let much_later = later + Duration::from_secs(61);
        assert!(resolver.request(target, much_later).is_some());
    }

    #[test]
    fn periodic_gratuitous_every_thirty_seconds() {
        let start = Instant::now();
        let mut resolver = started(start);
        assert!(resolver.tick(start + Duration::from_secs(29)).is_empty());
        assert_eq!(resolver.tick(start + Duration::from_secs(30)).len(), 1);
        // Timer rearmed from the send.
        assert!(resolver
            .tick(start + Duration::from_secs(31))
            .is_empty());
    }

    #[test]
    fn stopped_resolver_is_inert() {
        let now = Instant::now();
        let mut resolver = started(now);
        resolver.stop();
        assert!(resolver.request(Ipv4Addr::new(10, 0, 0, 1), now).is_none());
        assert!(resolver.tick(now + Duration::from_secs(60)).is_empty());
        let request = ArpPacket::request(PEER_MAC, Ipv4Addr::new(10, 0, 0, 9), my_ip()).encode();
        assert!(resolver.on_incoming(&request, now).is_none());
    }
}
