//! Control-plane protocol: Pack container, HTTP bootstrap, the
//! Hello/Auth/Welcome exchange, and the tunnel stream framing.

pub mod constants;
pub mod framer;
pub mod handshake;
pub mod http;
pub mod pack;

pub use framer::StreamFramer;
pub use handshake::{
    ClientBanner, Credential, HelloResponse, Policy, UdpAccelAdvertisement, UdpAccelParams,
    Welcome,
};
pub use http::{HttpCodec, HttpRequest, HttpResponse};
pub use pack::{Pack, PackValue};
