//! TCP stream framing for the tunnel phase.
//!
//! After the Welcome, the control channel carries a repetition of two
//! shapes, both big-endian:
//!
//! ```text
//! keep-alive:  [0xFFFFFFFF:u32] [size:u32] [size random bytes]
//! data batch:  [count:u32] [len:u32, len bytes] x count
//! ```
//!
//! The decoder accepts arbitrarily sized chunks, buffers partial frames
//! across calls, and emits only whole Ethernet payloads. The payloads are
//! opaque here; classification happens downstream.

use super::constants::{KEEPALIVE_MAGIC, MAX_BATCH_BLOCKS, MAX_KEEPALIVE_SIZE, MAX_PACKET_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Streaming decoder state.
#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    Blocks {
        remaining: usize,
    },
    KeepAlive {
        size: usize,
    },
}

/// Streaming decoder for the SoftEther TCP stream.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: BytesMut,
    state: DecodeState,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: DecodeState::Header,
        }
    }

    /// Feed a chunk, appending whole Ethernet payloads to `frames`.
    /// Keep-alives are consumed silently.
    pub fn feed(&mut self, data: &[u8], frames: &mut Vec<Bytes>) -> Result<()> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                DecodeState::Header => {
                    if self.buffer.remaining() < 4 {
                        return Ok(());
                    }
                    let head = (&self.buffer[..4]).get_u32();
                    if head == KEEPALIVE_MAGIC {
                        if self.buffer.remaining() < 8 {
                            return Ok(());
                        }
                        self.buffer.advance(4);
                        let size = self.buffer.get_u32() as usize;
                        if size > MAX_KEEPALIVE_SIZE {
                            return Err(Error::pack(format!("keep-alive size {size} too large")));
                        }
                        self.state = DecodeState::KeepAlive { size };
                    } else {
                        self.buffer.advance(4);
                        let count = head as usize;
                        if count > MAX_BATCH_BLOCKS {
                            return Err(Error::pack(format!("batch of {count} blocks")));
                        }
                        if count == 0 {
                            continue;
                        }
                        self.state = DecodeState::Blocks { remaining: count };
                    }
                }
                DecodeState::Blocks { remaining } => {
                    if self.buffer.remaining() < 4 {
                        return Ok(());
                    }
                    let len = (&self.buffer[..4]).get_u32() as usize;
                    if len == 0 {
                        return Err(Error::pack("zero-length block in data batch"));
                    }
                    if len > MAX_PACKET_SIZE * 2 {
                        return Err(Error::pack(format!("block of {len} bytes")));
                    }
                    if self.buffer.remaining() < 4 + len {
                        return Ok(());
                    }
                    self.buffer.advance(4);
                    frames.push(self.buffer.copy_to_bytes(len));
                    self.state = if remaining == 1 {
                        DecodeState::Header
                    } else {
                        DecodeState::Blocks {
                            remaining: remaining - 1,
                        }
                    };
                }
                DecodeState::KeepAlive { size } => {
                    if self.buffer.remaining() < size {
                        return Ok(());
                    }
                    self.buffer.advance(size);
                    self.state = DecodeState::Header;
                }
            }
        }
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a single Ethernet frame as a `count=1` data batch.
pub fn encode_frame(frame: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + frame.len());
    buf.put_u32(1);
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    buf.freeze()
}

/// Wrap several Ethernet frames into one data batch.
pub fn encode_batch(frames: &[Bytes]) -> Bytes {
    let total: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf.freeze()
}

/// Build a keep-alive frame with `padding` random bytes.
pub fn encode_keepalive(padding: usize) -> Bytes {
    let padding = padding.min(MAX_KEEPALIVE_SIZE);
    let mut buf = BytesMut::with_capacity(8 + padding);
    buf.put_u32(KEEPALIVE_MAGIC);
    buf.put_u32(padding as u32);
    if padding > 0 {
        let mut tail = vec![0u8; padding];
        crate::crypto::fill_random(&mut tail);
        buf.put_slice(&tail);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut StreamFramer, data: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        framer.feed(data, &mut frames).unwrap();
        frames
    }

    #[test]
    fn single_frame_roundtrip() {
        let mut framer = StreamFramer::new();
        let frames = collect(&mut framer, &encode_frame(b"ethernet-frame"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), b"ethernet-frame");
    }

    #[test]
    fn batch_preserves_order() {
        let batch = encode_batch(&[
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]);
        let mut framer = StreamFramer::new();
        let frames = collect(&mut framer, &batch);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].as_ref(), b"two");
    }

    #[test]
    fn keepalive_consumed_without_emission() {
        let mut framer = StreamFramer::new();
        let frames = collect(&mut framer, &encode_keepalive(32));
        assert!(frames.is_empty());
    }

    #[test]
    fn byte_at_a_time_feed_is_lossless() {
        // One batch of two 100-byte frames followed by a 7-byte keep-alive,
        // delivered one byte at a time.
        let frame_a = Bytes::from(vec![0xAAu8; 100]);
        let frame_b = Bytes::from(vec![0xBBu8; 100]);
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_batch(&[frame_a.clone(), frame_b.clone()]));
        stream.extend_from_slice(&encode_keepalive(7));

        let mut framer = StreamFramer::new();
        let mut frames = Vec::new();
        for byte in stream {
            framer.feed(&[byte], &mut frames).unwrap();
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frame_a);
        assert_eq!(frames[1], frame_b);
    }

    #[test]
    fn arbitrary_chunking_matches_single_feed() {
        let mut stream = Vec::new();
        for i in 0..10u8 {
            stream.extend_from_slice(&encode_frame(&vec![i; (i as usize + 1) * 17]));
            if i % 3 == 0 {
                stream.extend_from_slice(&encode_keepalive(i as usize));
            }
        }

        let mut whole = StreamFramer::new();
        let expect = collect(&mut whole, &stream);

        for chunk_size in [1usize, 2, 3, 5, 8, 13, 64, 1000] {
            let mut framer = StreamFramer::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                framer.feed(chunk, &mut frames).unwrap();
            }
            assert_eq!(frames, expect, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn zero_length_block_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(0);
        let mut framer = StreamFramer::new();
        let mut frames = Vec::new();
        assert!(framer.feed(&buf, &mut frames).is_err());
    }

    #[test]
    fn oversized_keepalive_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(KEEPALIVE_MAGIC);
        buf.put_u32(4096);
        let mut framer = StreamFramer::new();
        let mut frames = Vec::new();
        assert!(framer.feed(&buf, &mut frames).is_err());
    }

    #[test]
    fn keepalive_encoding_layout() {
        let ka = encode_keepalive(16);
        assert_eq!(&ka[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&ka[4..8], &[0, 0, 0, 16]);
        assert_eq!(ka.len(), 24);
    }
}
