//! Cryptographic helpers for authentication and session identity.
//!
//! SHA-0 password derivation (legacy SoftEther scheme), random material for
//! keys/cookies/XIDs, and the per-session virtual MAC address.

mod sha0;

pub use sha0::Sha0;

/// SHA-0 digest length in bytes.
pub const SHA0_DIGEST_LEN: usize = 20;

/// Hash data with SHA-0.
pub fn sha0(data: &[u8]) -> [u8; SHA0_DIGEST_LEN] {
    Sha0::digest(data)
}

/// SoftEther password hash: `SHA0(password || UPPERCASE(username))`.
pub fn hash_password(password: &str, username: &str) -> [u8; SHA0_DIGEST_LEN] {
    let mut h = Sha0::new();
    h.update(password.as_bytes());
    h.update(username.to_uppercase().as_bytes());
    h.finalize()
}

/// Challenge response sent during login:
/// `SHA0(password_hash || server_random)`.
pub fn secure_password(
    password_hash: &[u8; SHA0_DIGEST_LEN],
    server_random: &[u8; SHA0_DIGEST_LEN],
) -> [u8; SHA0_DIGEST_LEN] {
    let mut h = Sha0::new();
    h.update(password_hash);
    h.update(server_random);
    h.finalize()
}

/// Generate a locally administered unicast MAC for this session.
///
/// First octet: unicast (bit 0 clear), locally administered (bit 1 set).
pub fn generate_session_mac() -> [u8; 6] {
    use rand::RngCore;
    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    mac[0] = (mac[0] & 0xFC) | 0x02;
    mac
}

/// Fixed-size random material (keys, nonces, cookies).
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Fill a slice with random bytes.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(dest);
}

/// Random non-zero u32, used for cookies and DHCP transaction IDs.
pub fn random_nonzero_u32() -> u32 {
    use rand::Rng;
    loop {
        let v: u32 = rand::thread_rng().gen();
        if v != 0 {
            return v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_uppercases_username() {
        assert_eq!(hash_password("p@ss", "alice"), hash_password("p@ss", "ALICE"));
        assert_ne!(hash_password("p@ss", "alice"), hash_password("p@ss", "bob"));
    }

    #[test]
    fn secure_password_depends_on_random() {
        let hash = hash_password("p@ss", "alice");
        let r1 = [0u8; SHA0_DIGEST_LEN];
        let mut r2 = [0u8; SHA0_DIGEST_LEN];
        r2[19] = 1;
        assert_ne!(secure_password(&hash, &r1), secure_password(&hash, &r2));
    }

    #[test]
    fn legacy_derivation_shape() {
        // secure_password = SHA0(SHA0(pw || UPPER(user)) || random)
        let hash = hash_password("p@ss", "alice");
        let random: [u8; 20] = std::array::from_fn(|i| i as u8);
        let mut outer = Sha0::new();
        outer.update(&hash);
        outer.update(&random);
        assert_eq!(secure_password(&hash, &random), outer.finalize());
    }

    #[test]
    fn session_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = generate_session_mac();
            assert_eq!(mac[0] & 0x01, 0, "must be unicast");
            assert_eq!(mac[0] & 0x02, 0x02, "must be locally administered");
        }
    }

    #[test]
    fn nonzero_u32_is_nonzero() {
        for _ in 0..16 {
            assert_ne!(random_nonzero_u32(), 0);
        }
    }
}
