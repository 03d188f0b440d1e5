//! Hello / Auth / Welcome exchange.
//!
//! Three HTTP round trips on the control channel: the watermark Hello
//! (server answers with its 20-byte random), the login Pack, and the
//! Welcome Pack that either redirects (refused here) or describes the
//! session.

use super::constants::*;
use super::pack::Pack;
use crate::crypto::{self, SHA0_DIGEST_LEN};
use crate::error::{AuthError, Error, Result};
use base64::Engine;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Client identification sent in the login Pack.
#[derive(Debug, Clone)]
pub struct ClientBanner {
    pub client_str: String,
    pub version: u32,
    pub build: u32,
}

impl Default for ClientBanner {
    fn default() -> Self {
        Self {
            client_str: crate::CLIENT_STRING.to_string(),
            version: crate::CLIENT_VERSION,
            build: crate::CLIENT_BUILD,
        }
    }
}

/// Resolved credential, ready to be turned into auth Pack fields.
#[derive(Clone)]
pub enum Credential {
    /// Legacy SHA-0 challenge/response (`authtype=1`).
    Password { username: String, password: String },
    /// Pre-acquired bearer token (`authtype=6`).
    BearerToken { token: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::BearerToken { .. } => f.debug_struct("BearerToken").finish_non_exhaustive(),
        }
    }
}

impl Credential {
    /// Username this credential authenticates as. For tokens the name is
    /// pulled out of the JWT payload (`email`, then `preferred_username`).
    pub fn username(&self) -> Result<String> {
        match self {
            Self::Password { username, .. } => Ok(username.clone()),
            Self::BearerToken { token } => username_from_token(token),
        }
    }
}

/// Extract a username from a JWT-shaped bearer token.
pub fn username_from_token(token: &str) -> Result<String> {
    let payload_b64 = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::BuildAuthFromToken("token has no payload segment".into()))?;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64.trim_end_matches('='))
        .map_err(|e| AuthError::BuildAuthFromToken(format!("payload is not base64url: {e}")))?;
    let claims: serde_json::Value = serde_json::from_slice(&payload)
        .map_err(|e| AuthError::BuildAuthFromToken(format!("payload is not JSON: {e}")))?;

    for key in ["email", "preferred_username"] {
        if let Some(name) = claims.get(key).and_then(|v| v.as_str()) {
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
    }
    Err(AuthError::BuildAuthFromToken("no email or preferred_username claim".into()).into())
}

/// Body for the Hello POST: the watermark blob plus a random tail.
pub fn hello_body() -> Bytes {
    use rand::Rng;
    let tail_len = rand::thread_rng().gen_range(0..MAX_WATERMARK_PADDING);
    let mut buf = BytesMut::with_capacity(WATERMARK.len() + tail_len);
    buf.extend_from_slice(WATERMARK);
    let mut tail = vec![0u8; tail_len];
    crypto::fill_random(&mut tail);
    buf.extend_from_slice(&tail);
    buf.freeze()
}

/// Parsed Hello response.
#[derive(Debug, Clone)]
pub struct HelloResponse {
    pub random: [u8; SHA0_DIGEST_LEN],
    pub server_version: u32,
    pub server_build: u32,
    pub server_banner: String,
}

impl HelloResponse {
    pub fn from_pack(pack: &Pack) -> Result<Self> {
        if let Some(error) = pack.get_int("error") {
            if error != 0 {
                return Err(Error::handshake(format!("server error {error} in Hello")));
            }
        }
        let random_data = pack
            .get_data("random")
            .ok_or_else(|| Error::handshake("Hello response missing random"))?;
        if random_data.len() < SHA0_DIGEST_LEN {
            return Err(Error::handshake(format!(
                "Hello random too short: {} bytes",
                random_data.len()
            )));
        }
        let mut random = [0u8; SHA0_DIGEST_LEN];
        random.copy_from_slice(&random_data[..SHA0_DIGEST_LEN]);
        Ok(Self {
            random,
            server_version: pack.get_int("version").unwrap_or(0),
            server_build: pack.get_int("build").unwrap_or(0),
            server_banner: pack.get_str("hello").unwrap_or("").to_string(),
        })
    }
}

/// Client half of the UDP acceleration advertisement.
#[derive(Debug, Clone)]
pub struct UdpAccelAdvertisement {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    /// 20-byte v1 key, advertised for compatibility, never used by v2.
    pub client_key_v1: [u8; 20],
    /// 128-byte v2 key; the first 32 bytes become the send key.
    pub client_key_v2: [u8; 128],
}

/// Build the login Pack.
pub fn build_auth_pack(
    hub: &str,
    credential: &Credential,
    server_random: &[u8; SHA0_DIGEST_LEN],
    banner: &ClientBanner,
    udp_accel: Option<&UdpAccelAdvertisement>,
) -> Result<Pack> {
    let username = credential.username()?;

    let mut pack = Pack::new();
    pack.add_str("method", "login");
    pack.add_str("hubname", hub);
    pack.add_str("username", username.as_str());

    match credential {
        Credential::Password { username, password } => {
            let hash = crypto::hash_password(password, username);
            let proof = crypto::secure_password(&hash, server_random);
            pack.add_int("authtype", 1);
            pack.add_data("secure_password", proof.to_vec());
        }
        Credential::BearerToken { token } => {
            pack.add_int("authtype", 6);
            pack.add_str("jwt", token.clone());
        }
    }

    pack.add_int("protocol", 0);
    pack.add_bool("use_encrypt", true);
    pack.add_bool("use_compress", false);
    pack.add_int("max_connection", 1);
    pack.add_bool("half_connection", false);
    pack.add_bool("qos", false);

    pack.add_str("client_str", banner.client_str.as_str());
    pack.add_int("client_ver", banner.version);
    pack.add_int("client_build", banner.build);

    // Random filler the server ignores; varies the body size.
    let pencore_len = {
        use rand::Rng;
        rand::thread_rng().gen_range(0..MAX_PENCORE_SIZE)
    };
    let mut pencore = vec![0u8; pencore_len];
    crypto::fill_random(&mut pencore);
    pack.add_data("pencore", pencore);

    if let Some(adv) = udp_accel {
        pack.add_bool("use_udp_acceleration", true);
        pack.add_int("udp_acceleration_version", 2);
        pack.add_int("udp_acceleration_max_version", 2);
        pack.add_ipv4("udp_acceleration_client_ip", adv.client_ip);
        pack.add_int("udp_acceleration_client_port", u32::from(adv.client_port));
        pack.add_data("udp_acceleration_client_key", adv.client_key_v1.to_vec());
        pack.add_data("udp_acceleration_client_key_v2", adv.client_key_v2.to_vec());
        pack.add_bool("support_hmac_on_udp_acceleration", true);
        pack.add_bool("support_udp_accel_fast_disconnect_detect", true);
    }

    Ok(pack)
}

/// Server policy block: the raw `policy:*` flags and caps from Welcome,
/// with typed accessors for the handful the session consults.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    entries: BTreeMap<String, u32>,
}

impl Policy {
    pub fn from_pack(pack: &Pack) -> Self {
        let mut entries = BTreeMap::new();
        for item in pack.item_names() {
            if let Some(stripped) = item.strip_prefix("policy:") {
                if let Some(v) = pack.get_int(&item) {
                    entries.insert(stripped.to_string(), v);
                }
            }
        }
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name).unwrap_or(0) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// UDP acceleration parameters from Welcome.
#[derive(Debug, Clone)]
pub struct UdpAccelParams {
    pub version: u32,
    pub use_encryption: bool,
    pub use_hmac: bool,
    pub fast_disconnect_detect: bool,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub server_cookie: u32,
    pub client_cookie: u32,
    pub server_key_v2: Vec<u8>,
}

/// Parsed Welcome Pack.
#[derive(Debug, Clone)]
pub struct Welcome {
    pub session_name: String,
    pub connection_name: String,
    pub session_key: [u8; SHA0_DIGEST_LEN],
    pub session_key_32: u32,
    pub max_connection: u32,
    pub use_compress: bool,
    pub use_encrypt: bool,
    pub half_connection: bool,
    pub timeout: u32,
    pub enable_udp_recovery: bool,
    pub policy: Policy,
    pub udp_accel: Option<UdpAccelParams>,
    pub message: Option<String>,
}

impl Welcome {
    /// Parse the Welcome. `control_peer` is the TCP peer address, used as
    /// the UDP destination when the server does not name one.
    pub fn from_pack(pack: &Pack, control_peer: Ipv4Addr) -> Result<Self> {
        if let Some(error) = pack.get_int("error") {
            if error != 0 {
                let detail = pack.get_str("error_str").unwrap_or("");
                return Err(Error::handshake(format!(
                    "server error {error} in Welcome: {detail}"
                )));
            }
        }

        if pack.get_bool("redirect").unwrap_or(false) {
            return Err(Error::handshake("server redirect unimplemented"));
        }

        let session_name = pack
            .get_str("session_name")
            .ok_or_else(|| Error::handshake("Welcome missing session_name"))?
            .to_string();
        let connection_name = pack
            .get_str("connection_name")
            .ok_or_else(|| Error::handshake("Welcome missing connection_name"))?
            .to_string();
        let key_data = pack
            .get_data("session_key")
            .ok_or_else(|| Error::handshake("Welcome missing session_key"))?;
        if key_data.len() < SHA0_DIGEST_LEN {
            return Err(Error::handshake(format!(
                "session_key too short: {} bytes",
                key_data.len()
            )));
        }
        let mut session_key = [0u8; SHA0_DIGEST_LEN];
        session_key.copy_from_slice(&key_data[..SHA0_DIGEST_LEN]);
        let session_key_32 = pack
            .get_int("session_key_32")
            .ok_or_else(|| Error::handshake("Welcome missing session_key_32"))?;

        let udp_accel = Self::parse_udp_accel(pack, control_peer)?;

        let message = pack
            .get_str("msg")
            .map(str::to_string)
            .filter(|m| !m.is_empty());

        Ok(Self {
            session_name,
            connection_name,
            session_key,
            session_key_32,
            max_connection: pack.get_int("max_connection").unwrap_or(1),
            use_compress: pack.get_bool("use_compress").unwrap_or(false),
            use_encrypt: pack.get_bool("use_encrypt").unwrap_or(true),
            half_connection: pack.get_bool("half_connection").unwrap_or(false),
            timeout: pack.get_int("timeout").unwrap_or(0),
            enable_udp_recovery: pack.get_bool("enable_udp_recovery").unwrap_or(false),
            policy: Policy::from_pack(pack),
            udp_accel,
            message,
        })
    }

    fn parse_udp_accel(pack: &Pack, control_peer: Ipv4Addr) -> Result<Option<UdpAccelParams>> {
        if !pack.get_bool("use_udp_acceleration").unwrap_or(false) {
            return Ok(None);
        }

        let version = pack.get_int("udp_acceleration_version").unwrap_or(1);
        if version < 2 {
            return Err(Error::handshake("UDP acceleration v1 unsupported"));
        }

        let server_port = pack.get_int("udp_acceleration_server_port").unwrap_or(0) as u16;
        if server_port == 0 {
            debug!("UDP acceleration advertised without a server port; ignoring");
            return Ok(None);
        }

        let server_cookie = pack.get_int("udp_acceleration_server_cookie").unwrap_or(0);
        let client_cookie = pack.get_int("udp_acceleration_client_cookie").unwrap_or(0);
        if server_cookie == 0 || client_cookie == 0 {
            warn!("UDP acceleration cookies missing; staying on TCP");
            return Ok(None);
        }

        let server_key_v2 = pack
            .get_data("udp_acceleration_server_key_v2")
            .map(|d| d.to_vec())
            .ok_or_else(|| Error::handshake("UDP acceleration v2 key missing"))?;
        if server_key_v2.len() < 32 {
            return Err(Error::handshake(format!(
                "UDP acceleration v2 key too short: {} bytes",
                server_key_v2.len()
            )));
        }

        let server_ip = pack
            .get_ipv4("udp_acceleration_server_ip")
            .unwrap_or(control_peer);

        Ok(Some(UdpAccelParams {
            version,
            use_encryption: pack
                .get_bool("udp_acceleration_use_encryption")
                .unwrap_or(true),
            use_hmac: pack.get_bool("use_hmac_on_udp_acceleration").unwrap_or(false),
            fast_disconnect_detect: pack
                .get_bool("udp_accel_fast_disconnect_detect")
                .unwrap_or(false),
            server_ip,
            server_port,
            server_cookie,
            client_cookie,
            server_key_v2,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Ipv4Addr {
        Ipv4Addr::new(198, 51, 100, 7)
    }

    fn minimal_welcome_pack() -> Pack {
        let mut pack = Pack::new();
        pack.add_str("session_name", "S-1");
        pack.add_str("connection_name", "C-1");
        pack.add_data("session_key", vec![0x42u8; 20]);
        pack.add_int("session_key_32", 0x1122_3344);
        pack
    }

    #[test]
    fn hello_parse_happy_path() {
        let mut pack = Pack::new();
        let random: Vec<u8> = (0u8..20).collect();
        pack.add_data("random", random.clone());
        pack.add_int("version", 444);
        pack.add_int("build", 9807);
        pack.add_str("hello", "SoftEther VPN Server");
        let hello = HelloResponse::from_pack(&pack).unwrap();
        assert_eq!(&hello.random[..], &random[..]);
        assert_eq!(hello.server_version, 444);
        assert_eq!(hello.server_banner, "SoftEther VPN Server");
    }

    #[test]
    fn hello_missing_or_short_random_fails() {
        let pack = Pack::new();
        assert!(HelloResponse::from_pack(&pack).is_err());

        let mut short = Pack::new();
        short.add_data("random", vec![0u8; 8]);
        assert!(HelloResponse::from_pack(&short).is_err());
    }

    #[test]
    fn hello_error_field_fails() {
        let mut pack = Pack::new();
        pack.add_int("error", 3);
        pack.add_data("random", vec![0u8; 20]);
        assert!(HelloResponse::from_pack(&pack).is_err());
    }

    #[test]
    fn hello_body_carries_watermark_prefix() {
        let body = hello_body();
        assert!(body.len() >= WATERMARK.len());
        assert!(body.len() < WATERMARK.len() + MAX_WATERMARK_PADDING);
        assert_eq!(&body[..WATERMARK.len()], WATERMARK);
    }

    #[test]
    fn auth_pack_password_proof_derivation() {
        // secure_password = SHA0(SHA0("p@ss" || "ALICE") || random)
        let random: [u8; 20] = std::array::from_fn(|i| i as u8);
        let credential = Credential::Password {
            username: "alice".into(),
            password: "p@ss".into(),
        };
        let pack = build_auth_pack("H", &credential, &random, &ClientBanner::default(), None)
            .unwrap();

        assert_eq!(pack.get_str("method"), Some("login"));
        assert_eq!(pack.get_str("hubname"), Some("H"));
        assert_eq!(pack.get_str("username"), Some("alice"));
        assert_eq!(pack.get_int("authtype"), Some(1));
        assert_eq!(pack.get_int("protocol"), Some(0));
        assert_eq!(pack.get_int("use_encrypt"), Some(1));
        assert_eq!(pack.get_int("use_compress"), Some(0));
        assert_eq!(pack.get_int("max_connection"), Some(1));
        assert_eq!(pack.get_int("half_connection"), Some(0));
        assert_eq!(pack.get_int("qos"), Some(0));

        let expect = crypto::secure_password(&crypto::hash_password("p@ss", "alice"), &random);
        assert_eq!(
            pack.get_data("secure_password").map(|d| d.to_vec()),
            Some(expect.to_vec())
        );
    }

    #[test]
    fn auth_pack_token_shape() {
        // {"email":"alice@example.com"}
        let token = format!(
            "eyJhbGciOiJSUzI1NiJ9.{}.sig",
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(br#"{"email":"alice@example.com"}"#)
        );
        let credential = Credential::BearerToken { token: token.clone() };
        let random = [0u8; 20];
        let pack = build_auth_pack("H", &credential, &random, &ClientBanner::default(), None)
            .unwrap();
        assert_eq!(pack.get_int("authtype"), Some(6));
        assert_eq!(pack.get_str("jwt"), Some(token.as_str()));
        assert_eq!(pack.get_str("username"), Some("alice@example.com"));
        assert!(!pack.contains("secure_password"));
    }

    #[test]
    fn token_username_prefers_email_then_preferred_username() {
        let enc = |claims: &str| {
            format!(
                "h.{}.s",
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(claims.as_bytes())
            )
        };
        assert_eq!(
            username_from_token(&enc(r#"{"email":"a@b.c","preferred_username":"u"}"#)).unwrap(),
            "a@b.c"
        );
        assert_eq!(
            username_from_token(&enc(r#"{"preferred_username":"u"}"#)).unwrap(),
            "u"
        );
        assert!(matches!(
            username_from_token(&enc(r#"{"sub":"x"}"#)),
            Err(Error::Auth(AuthError::BuildAuthFromToken(_)))
        ));
        assert!(username_from_token("not-a-jwt").is_err());
    }

    #[test]
    fn auth_pack_includes_udp_advertisement() {
        let adv = UdpAccelAdvertisement {
            client_ip: Ipv4Addr::new(192, 0, 2, 10),
            client_port: 40123,
            client_key_v1: [1u8; 20],
            client_key_v2: [2u8; 128],
        };
        let credential = Credential::Password {
            username: "u".into(),
            password: "p".into(),
        };
        let pack = build_auth_pack("H", &credential, &[0u8; 20], &ClientBanner::default(), Some(&adv))
            .unwrap();
        assert_eq!(pack.get_int("use_udp_acceleration"), Some(1));
        assert_eq!(pack.get_int("udp_acceleration_version"), Some(2));
        assert_eq!(pack.get_int("udp_acceleration_client_port"), Some(40123));
        assert_eq!(
            pack.get_ipv4("udp_acceleration_client_ip"),
            Some(Ipv4Addr::new(192, 0, 2, 10))
        );
        assert_eq!(
            pack.get_data("udp_acceleration_client_key_v2").map(|d| d.len()),
            Some(128)
        );
    }

    #[test]
    fn welcome_parses_session_descriptor() {
        let mut pack = minimal_welcome_pack();
        pack.add_int("max_connection", 4);
        pack.add_bool("use_compress", false);
        pack.add_int("timeout", 20000);
        pack.add_int("policy:NoBridge", 1);
        pack.add_int("policy:MaxConnection", 32);

        let welcome = Welcome::from_pack(&pack, peer()).unwrap();
        assert_eq!(welcome.session_name, "S-1");
        assert_eq!(welcome.connection_name, "C-1");
        assert_eq!(welcome.session_key, [0x42u8; 20]);
        assert_eq!(welcome.session_key_32, 0x1122_3344);
        assert_eq!(welcome.max_connection, 4);
        assert_eq!(welcome.timeout, 20000);
        assert!(welcome.use_encrypt, "defaults to true");
        assert!(!welcome.half_connection);
        assert!(welcome.policy.flag("NoBridge"));
        assert_eq!(welcome.policy.get("maxconnection"), Some(32));
        assert!(welcome.udp_accel.is_none());
    }

    #[test]
    fn welcome_redirect_refused() {
        let mut pack = minimal_welcome_pack();
        pack.add_bool("redirect", true);
        pack.add_int("ip", 0x0100_A8C0);
        let err = Welcome::from_pack(&pack, peer()).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("redirect"));
    }

    #[test]
    fn welcome_missing_mandatory_field_fails() {
        let mut pack = Pack::new();
        pack.add_str("session_name", "S-1");
        assert!(Welcome::from_pack(&pack, peer()).is_err());
    }

    #[test]
    fn welcome_udp_accel_v2_parsed() {
        let mut pack = minimal_welcome_pack();
        pack.add_bool("use_udp_acceleration", true);
        pack.add_int("udp_acceleration_version", 2);
        pack.add_int("udp_acceleration_server_port", 5555);
        pack.add_int("udp_acceleration_server_cookie", 0xAA);
        pack.add_int("udp_acceleration_client_cookie", 0xBB);
        pack.add_data("udp_acceleration_server_key_v2", vec![0xCD; 32]);
        pack.add_ipv4("udp_acceleration_server_ip", Ipv4Addr::new(198, 51, 100, 8));

        let welcome = Welcome::from_pack(&pack, peer()).unwrap();
        let accel = welcome.udp_accel.unwrap();
        assert_eq!(accel.server_port, 5555);
        assert_eq!(accel.server_cookie, 0xAA);
        assert_eq!(accel.client_cookie, 0xBB);
        assert_eq!(accel.server_ip, Ipv4Addr::new(198, 51, 100, 8));
        assert_eq!(accel.server_key_v2, vec![0xCD; 32]);
    }

    #[test]
    fn welcome_udp_accel_v1_refused() {
        let mut pack = minimal_welcome_pack();
        pack.add_bool("use_udp_acceleration", true);
        pack.add_int("udp_acceleration_version", 1);
        pack.add_int("udp_acceleration_server_port", 5555);
        assert!(Welcome::from_pack(&pack, peer()).is_err());
    }

    #[test]
    fn welcome_udp_accel_short_key_refused() {
        let mut pack = minimal_welcome_pack();
        pack.add_bool("use_udp_acceleration", true);
        pack.add_int("udp_acceleration_version", 2);
        pack.add_int("udp_acceleration_server_port", 5555);
        pack.add_int("udp_acceleration_server_cookie", 1);
        pack.add_int("udp_acceleration_client_cookie", 2);
        pack.add_data("udp_acceleration_server_key_v2", vec![0u8; 16]);
        assert!(Welcome::from_pack(&pack, peer()).is_err());
    }

    #[test]
    fn welcome_udp_accel_defaults_to_control_peer_ip() {
        let mut pack = minimal_welcome_pack();
        pack.add_bool("use_udp_acceleration", true);
        pack.add_int("udp_acceleration_version", 2);
        pack.add_int("udp_acceleration_server_port", 5555);
        pack.add_int("udp_acceleration_server_cookie", 1);
        pack.add_int("udp_acceleration_client_cookie", 2);
        pack.add_data("udp_acceleration_server_key_v2", vec![0u8; 32]);

        let welcome = Welcome::from_pack(&pack, peer()).unwrap();
        assert_eq!(welcome.udp_accel.unwrap().server_ip, peer());
    }
}
