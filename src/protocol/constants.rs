//! Protocol constants.

/// Signature target path for the initial Hello request.
pub const SIGNATURE_TARGET: &str = "/vpnsvc/connect.cgi";

/// Target path for authenticated Pack exchange.
pub const VPN_TARGET: &str = "/vpnsvc/vpn.cgi";

/// Content type for the Hello watermark body.
pub const CONTENT_TYPE_SIGNATURE: &str = "image/jpeg";

/// Content type for Pack bodies.
pub const CONTENT_TYPE_PACK: &str = "application/octet-stream";

/// Maximum Pack value size.
pub const MAX_VALUE_SIZE: usize = 96 * 1024 * 1024;

/// Maximum number of values per Pack item.
pub const MAX_VALUE_COUNT: usize = 262_144;

/// Maximum number of items in a Pack.
pub const MAX_ITEMS: usize = 65_536;

/// Maximum item name length after the historical NUL is stripped.
pub const MAX_NAME_LEN: usize = 64;

/// Magic number marking a keep-alive frame on the TCP stream.
pub const KEEPALIVE_MAGIC: u32 = 0xFFFF_FFFF;

/// Maximum keep-alive padding on the TCP stream.
pub const MAX_KEEPALIVE_SIZE: usize = 512;

/// Maximum Ethernet frame size carried in a data block.
pub const MAX_PACKET_SIZE: usize = 1514;

/// Maximum blocks accepted in one data batch.
pub const MAX_BATCH_BLOCKS: usize = 512;

/// Maximum random tail appended to the Hello watermark.
pub const MAX_WATERMARK_PADDING: usize = 2000;

/// Maximum random `pencore` blob in the auth Pack.
pub const MAX_PENCORE_SIZE: usize = 1000;

/// Opaque blob sent as the body prefix of the Hello POST. The server only
/// checks the prefix, not the full historical JPEG.
pub const WATERMARK: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x01, 0x00,
    0x48, 0x00, 0x48, 0x00, 0x00, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x08, 0x06, 0x06, 0x07, 0x06,
    0x05, 0x08, 0x07, 0x07, 0x07, 0x09, 0x09, 0x08, 0x0A, 0x0C, 0x14, 0x0D, 0x0C, 0x0B, 0x0B,
    0x0C, 0x19, 0x12, 0x13, 0x0F,
];
