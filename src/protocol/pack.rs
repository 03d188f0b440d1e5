//! Pack serialization.
//!
//! Pack is the tag/type/value container SoftEther uses for every
//! control-plane message. All integers on the wire are big-endian.
//!
//! Layout:
//!
//! ```text
//! [item_count:u32] then per item:
//!   [name_len+1:u32] [name:ascii, no NUL] [type:u32] [value_count:u32] [values...]
//! ```
//!
//! Value encodings: `Int -> u32`, `Int64 -> u64`,
//! `Data/Str/UniStr -> [len:u32][bytes]`. The name length is stored as
//! `len + 1` to mirror the historical trailing NUL; string *values* are
//! stored at their exact byte length. The decoder strips a single trailing
//! NUL from names and string values when one is present.

use super::constants::{MAX_ITEMS, MAX_NAME_LEN, MAX_VALUE_COUNT, MAX_VALUE_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PackType {
    Int = 0,
    Data = 1,
    Str = 2,
    UniStr = 3,
    Int64 = 4,
}

impl TryFrom<u32> for PackType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Int),
            1 => Ok(Self::Data),
            2 => Ok(Self::Str),
            3 => Ok(Self::UniStr),
            4 => Ok(Self::Int64),
            other => Err(Error::pack(format!("unknown value type {other}"))),
        }
    }
}

/// A single value inside an item.
#[derive(Debug, Clone, PartialEq)]
pub enum PackValue {
    Int(u32),
    Int64(u64),
    Str(String),
    UniStr(String),
    Data(Bytes),
}

impl PackValue {
    fn wire_type(&self) -> PackType {
        match self {
            Self::Int(_) => PackType::Int,
            Self::Int64(_) => PackType::Int64,
            Self::Str(_) => PackType::Str,
            Self::UniStr(_) => PackType::UniStr,
            Self::Data(_) => PackType::Data,
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<u64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::Int(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::UniStr(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Bytes> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }
}

/// One named item holding one or more values of a single type.
#[derive(Debug, Clone)]
pub struct PackItem {
    pub name: String,
    pub values: Vec<PackValue>,
}

/// Ordered Pack container. Keys are unique by convention; lookups return the
/// first value stored under a name and are case-insensitive, matching the
/// server's behavior.
#[derive(Debug, Clone, Default)]
pub struct Pack {
    items: Vec<PackItem>,
}

impl Pack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    fn find(&self, name: &str) -> Option<&PackItem> {
        self.items.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    fn push_value(&mut self, name: &str, value: PackValue) {
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.name.eq_ignore_ascii_case(name))
        {
            item.values.push(value);
        } else {
            self.items.push(PackItem {
                name: name.to_string(),
                values: vec![value],
            });
        }
    }

    pub fn add_int(&mut self, name: &str, value: u32) {
        self.push_value(name, PackValue::Int(value));
    }

    pub fn add_int64(&mut self, name: &str, value: u64) {
        self.push_value(name, PackValue::Int64(value));
    }

    pub fn add_str(&mut self, name: &str, value: impl Into<String>) {
        self.push_value(name, PackValue::Str(value.into()));
    }

    pub fn add_unistr(&mut self, name: &str, value: impl Into<String>) {
        self.push_value(name, PackValue::UniStr(value.into()));
    }

    pub fn add_data(&mut self, name: &str, value: impl Into<Bytes>) {
        self.push_value(name, PackValue::Data(value.into()));
    }

    /// Booleans travel as `Int(0|1)`.
    pub fn add_bool(&mut self, name: &str, value: bool) {
        self.add_int(name, u32::from(value));
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&PackValue> {
        self.find(name).and_then(|i| i.values.first())
    }

    /// All values stored under `name`.
    pub fn get_all(&self, name: &str) -> Option<&[PackValue]> {
        self.find(name).map(|i| i.values.as_slice())
    }

    /// Item names in insertion order.
    pub fn item_names(&self) -> Vec<String> {
        self.items.iter().map(|i| i.name.clone()).collect()
    }

    pub fn get_int(&self, name: &str) -> Option<u32> {
        self.get(name).and_then(PackValue::as_int)
    }

    pub fn get_int64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(PackValue::as_int64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PackValue::as_str)
    }

    pub fn get_data(&self, name: &str) -> Option<&Bytes> {
        self.get(name).and_then(PackValue::as_data)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_int(name).map(|v| v != 0)
    }

    // ------------------------------------------------------------------
    // IP address convention
    // ------------------------------------------------------------------

    /// Add an IPv4 address under `name` with the `@ipv6_*` sibling keys the
    /// wire format expects. The u32 holds the octets in little-endian order.
    pub fn add_ipv4(&mut self, name: &str, addr: Ipv4Addr) {
        self.add_bool(&format!("{name}@ipv6_bool"), false);
        self.add_data(&format!("{name}@ipv6_array"), vec![0u8; 16]);
        self.add_int(&format!("{name}@ipv6_scope_id"), 0);
        self.add_int(name, u32::from_le_bytes(addr.octets()));
    }

    /// Read an IPv4 address stored under the little-endian-octet convention.
    /// Returns `None` when the sibling keys declare the value IPv6 or the
    /// address is unspecified.
    pub fn get_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        if self.get_bool(&format!("{name}@ipv6_bool")).unwrap_or(false) {
            return None;
        }
        let raw = self.get_int(name)?;
        let octets = raw.to_le_bytes();
        let addr = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        if addr.is_unspecified() {
            None
        } else {
            Some(addr)
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_u32(self.items.len() as u32);
        for item in &self.items {
            let wire_type = item
                .values
                .first()
                .map(PackValue::wire_type)
                .unwrap_or(PackType::Int);
            buf.put_u32(item.name.len() as u32 + 1);
            buf.put_slice(item.name.as_bytes());
            buf.put_u32(wire_type as u32);
            buf.put_u32(item.values.len() as u32);
            for value in &item.values {
                match value {
                    PackValue::Int(v) => buf.put_u32(*v),
                    PackValue::Int64(v) => buf.put_u64(*v),
                    PackValue::Str(s) | PackValue::UniStr(s) => {
                        buf.put_u32(s.len() as u32);
                        buf.put_slice(s.as_bytes());
                    }
                    PackValue::Data(d) => {
                        buf.put_u32(d.len() as u32);
                        buf.put_slice(d);
                    }
                }
            }
        }
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let item_count = read_u32(&mut buf)? as usize;
        if item_count > MAX_ITEMS {
            return Err(Error::pack(format!("too many items: {item_count}")));
        }

        let mut pack = Pack::new();
        for _ in 0..item_count {
            let item = Self::parse_item(&mut buf)?;
            pack.items.push(item);
        }
        Ok(pack)
    }

    fn parse_item(buf: &mut &[u8]) -> Result<PackItem> {
        let stored_len = read_u32(buf)? as usize;
        if stored_len == 0 || stored_len > MAX_NAME_LEN + 1 {
            return Err(Error::pack(format!("bad item name length {stored_len}")));
        }
        // Stored as len + 1 for a NUL that is not actually written.
        let name_len = stored_len - 1;
        if buf.remaining() < name_len {
            return Err(Error::pack("truncated item name"));
        }
        let mut name_bytes = &buf[..name_len];
        buf.advance(name_len);
        if let [head @ .., 0] = name_bytes {
            name_bytes = head;
        }
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        let wire_type = PackType::try_from(read_u32(buf)?)?;
        let value_count = read_u32(buf)? as usize;
        if value_count > MAX_VALUE_COUNT {
            return Err(Error::pack(format!("too many values: {value_count}")));
        }

        let mut values = Vec::with_capacity(value_count.min(64));
        for _ in 0..value_count {
            values.push(Self::parse_value(buf, wire_type)?);
        }
        Ok(PackItem { name, values })
    }

    fn parse_value(buf: &mut &[u8], wire_type: PackType) -> Result<PackValue> {
        match wire_type {
            PackType::Int => Ok(PackValue::Int(read_u32(buf)?)),
            PackType::Int64 => {
                if buf.remaining() < 8 {
                    return Err(Error::pack("truncated int64 value"));
                }
                Ok(PackValue::Int64(buf.get_u64()))
            }
            PackType::Str | PackType::UniStr => {
                let bytes = read_block(buf)?;
                let bytes = match bytes {
                    // Tolerate a trailing NUL some writers include.
                    [head @ .., 0] => head,
                    other => other,
                };
                let s = String::from_utf8_lossy(bytes).into_owned();
                Ok(match wire_type {
                    PackType::Str => PackValue::Str(s),
                    _ => PackValue::UniStr(s),
                })
            }
            PackType::Data => {
                let bytes = read_block(buf)?;
                Ok(PackValue::Data(Bytes::copy_from_slice(bytes)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Redacted debug output
    // ------------------------------------------------------------------

    /// Render the pack for logs, omitting every key outside the allowlist.
    /// Credentials, key material, cookies, and raw payloads never reach the
    /// log stream.
    pub fn redacted(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("Pack{");
        let mut first = true;
        for item in &self.items {
            if !first {
                out.push_str(", ");
            }
            first = false;
            if !is_loggable_key(&item.name) {
                let _ = write!(out, "{}=<omitted>", item.name);
                continue;
            }
            match item.values.first() {
                Some(PackValue::Int(v)) => {
                    let _ = write!(out, "{}={}", item.name, v);
                }
                Some(PackValue::Int64(v)) => {
                    let _ = write!(out, "{}={}", item.name, v);
                }
                Some(PackValue::Str(s)) | Some(PackValue::UniStr(s)) => {
                    let _ = write!(out, "{}={:?}", item.name, s);
                }
                Some(PackValue::Data(d)) => {
                    let _ = write!(out, "{}=<{} bytes>", item.name, d.len());
                }
                None => {
                    let _ = write!(out, "{}=<empty>", item.name);
                }
            }
        }
        out.push('}');
        out
    }
}

/// Keys safe to show in logs. Everything else is structural metadata at
/// best and secret material at worst, so the list is explicit.
fn is_loggable_key(name: &str) -> bool {
    const ALLOWED: &[&str] = &[
        "method",
        "hubname",
        "username",
        "authtype",
        "protocol",
        "use_encrypt",
        "use_compress",
        "max_connection",
        "half_connection",
        "qos",
        "client_str",
        "client_ver",
        "client_build",
        "version",
        "build",
        "hello",
        "error",
        "redirect",
        "session_name",
        "connection_name",
        "timeout",
        "enable_udp_recovery",
        "use_udp_acceleration",
        "udp_acceleration_version",
        "udp_acceleration_server_port",
        "udp_acceleration_client_port",
        "udp_accel_fast_disconnect_detect",
        "udp_acceleration_use_encryption",
        "use_hmac_on_udp_acceleration",
    ];
    ALLOWED.iter().any(|k| name.eq_ignore_ascii_case(k))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::pack("truncated u32"));
    }
    Ok(buf.get_u32())
}

fn read_block<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_u32(buf)? as usize;
    if len > MAX_VALUE_SIZE {
        return Err(Error::pack(format!("value too large: {len}")));
    }
    if buf.remaining() < len {
        return Err(Error::pack("truncated value"));
    }
    let out = &buf[..len];
    buf.advance(len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_types() {
        let mut pack = Pack::new();
        pack.add_int("version", 444);
        pack.add_int64("tick", 0x0123_4567_89AB_CDEF);
        pack.add_str("hello", "world");
        pack.add_unistr("banner", "vpn server");
        pack.add_bool("enabled", true);
        pack.add_data("blob", vec![1, 2, 3, 4, 5]);

        let parsed = Pack::from_bytes(&pack.to_bytes()).unwrap();
        assert_eq!(parsed.get_int("version"), Some(444));
        assert_eq!(parsed.get_int64("tick"), Some(0x0123_4567_89AB_CDEF));
        assert_eq!(parsed.get_str("hello"), Some("world"));
        assert_eq!(parsed.get_str("banner"), Some("vpn server"));
        assert_eq!(parsed.get_bool("enabled"), Some(true));
        assert_eq!(parsed.get_data("blob").map(|b| b.to_vec()), Some(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn name_length_stored_plus_one() {
        let mut pack = Pack::new();
        pack.add_int("ab", 7);
        let bytes = pack.to_bytes();
        // item_count(4) then name_len at offset 4
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        assert_eq!(&bytes[8..10], b"ab");
    }

    #[test]
    fn string_values_written_without_nul() {
        let mut pack = Pack::new();
        pack.add_str("s", "xyz");
        let bytes = pack.to_bytes();
        // count, name_len, name(1), type, value_count, str_len
        let str_len_off = 4 + 4 + 1 + 4 + 4;
        assert_eq!(&bytes[str_len_off..str_len_off + 4], &[0, 0, 0, 3]);
    }

    #[test]
    fn decode_strips_trailing_nul_in_string_value() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(2); // "v" + historical NUL
        buf.put_slice(b"v");
        buf.put_u32(PackType::Str as u32);
        buf.put_u32(1);
        buf.put_u32(4);
        buf.put_slice(b"abc\0");
        let pack = Pack::from_bytes(&buf).unwrap();
        assert_eq!(pack.get_str("v"), Some("abc"));
    }

    #[test]
    fn lookup_is_case_insensitive_and_first_value_wins() {
        let mut pack = Pack::new();
        pack.add_int("Key", 1);
        pack.add_int("key", 2);
        assert_eq!(pack.get_int("KEY"), Some(1));
        assert_eq!(pack.get_all("key").unwrap().len(), 2);
    }

    #[test]
    fn ipv4_little_endian_octets() {
        let mut pack = Pack::new();
        pack.add_ipv4("ip", Ipv4Addr::new(10, 0, 0, 5));
        // b0 | b1<<8 | b2<<16 | b3<<24
        assert_eq!(pack.get_int("ip"), Some(10 | (5 << 24)));
        assert_eq!(pack.get_ipv4("ip"), Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn ipv6_flagged_address_not_returned_as_v4() {
        let mut pack = Pack::new();
        pack.add_bool("ip@ipv6_bool", true);
        pack.add_int("ip", 1);
        assert_eq!(pack.get_ipv4("ip"), None);
    }

    #[test]
    fn truncated_input_rejected() {
        let mut pack = Pack::new();
        pack.add_data("blob", vec![0u8; 32]);
        let bytes = pack.to_bytes();
        for cut in [1, 5, 9, bytes.len() - 1] {
            assert!(Pack::from_bytes(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn oversized_name_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(200);
        let pack = Pack::from_bytes(&buf);
        assert!(pack.is_err());
    }

    #[test]
    fn redacted_printer_hides_secret_keys() {
        let mut pack = Pack::new();
        pack.add_str("method", "login");
        pack.add_data("secure_password", vec![0u8; 20]);
        pack.add_str("jwt", "eyJhbGciOi...");
        pack.add_int("error", 0);
        let text = pack.redacted();
        assert!(text.contains("method=\"login\""));
        assert!(text.contains("error=0"));
        assert!(text.contains("secure_password=<omitted>"));
        assert!(!text.contains("eyJhbGciOi"));
    }

    #[test]
    fn empty_pack_roundtrip() {
        let parsed = Pack::from_bytes(&Pack::new().to_bytes()).unwrap();
        assert!(parsed.is_empty());
    }
}
