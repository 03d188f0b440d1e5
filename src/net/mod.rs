//! Transport layer: the TLS control channel and the accelerated UDP
//! data path with its readiness gating.

pub mod connection;
pub mod readiness;
pub mod udp_accel;

pub use connection::ControlChannel;
pub use readiness::{EndpointBook, ReadinessTracker, RecvVerdict};
pub use udp_accel::{UdpAccelSocket, UdpHandle};
