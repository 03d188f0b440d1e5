//! SHA-0 digest.
//!
//! SHA-0 is the withdrawn predecessor of SHA-1; the only difference is that
//! the message schedule expansion omits the one-bit left rotate. SoftEther
//! derives its password proof from SHA-0, so the legacy function has to be
//! reproduced exactly. No maintained crate ships it.

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 20;

const BLOCK_LEN: usize = 64;

const INIT: [u32; 5] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476, 0xC3D2_E1F0];

const K: [u32; 4] = [0x5A82_7999, 0x6ED9_EBA1, 0x8F1B_BCDC, 0xCA62_C1D6];

/// Streaming SHA-0 hasher.
#[derive(Clone)]
pub struct Sha0 {
    state: [u32; 5],
    block: [u8; BLOCK_LEN],
    block_len: usize,
    message_len: u64,
}

impl Sha0 {
    pub fn new() -> Self {
        Self {
            state: INIT,
            block: [0u8; BLOCK_LEN],
            block_len: 0,
            message_len: 0,
        }
    }

    /// Absorb more input.
    pub fn update(&mut self, mut input: &[u8]) {
        self.message_len += input.len() as u64;

        if self.block_len > 0 {
            let take = input.len().min(BLOCK_LEN - self.block_len);
            self.block[self.block_len..self.block_len + take].copy_from_slice(&input[..take]);
            self.block_len += take;
            input = &input[take..];
            if self.block_len == BLOCK_LEN {
                let full = self.block;
                self.compress(&full);
                self.block_len = 0;
            }
        }

        while input.len() >= BLOCK_LEN {
            let full: [u8; BLOCK_LEN] = input[..BLOCK_LEN].try_into().unwrap();
            self.compress(&full);
            input = &input[BLOCK_LEN..];
        }

        if !input.is_empty() {
            self.block[..input.len()].copy_from_slice(input);
            self.block_len = input.len();
        }
    }

    /// Apply padding and produce the digest.
    pub fn finalize(mut self) -> [u8; DIGEST_LEN] {
        let bit_len = self.message_len * 8;

        self.block[self.block_len] = 0x80;
        self.block_len += 1;

        if self.block_len > BLOCK_LEN - 8 {
            self.block[self.block_len..].fill(0);
            let full = self.block;
            self.compress(&full);
            self.block_len = 0;
        }

        self.block[self.block_len..BLOCK_LEN - 8].fill(0);
        self.block[BLOCK_LEN - 8..].copy_from_slice(&bit_len.to_be_bytes());
        let full = self.block;
        self.compress(&full);

        let mut out = [0u8; DIGEST_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// One-shot digest.
    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }

    fn compress(&mut self, block: &[u8; BLOCK_LEN]) {
        let mut w = [0u32; 80];
        for (i, chunk) in block.chunks_exact(4).enumerate() {
            w[i] = u32::from_be_bytes(chunk.try_into().unwrap());
        }
        for i in 16..80 {
            // SHA-1 rotates this XOR left by one bit; SHA-0 does not.
            w[i] = w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16];
        }

        let [mut a, mut b, mut c, mut d, mut e] = self.state;

        for (i, &wi) in w.iter().enumerate() {
            let (f, k) = match i {
                0..=19 => ((b & c) | (!b & d), K[0]),
                20..=39 => (b ^ c ^ d, K[1]),
                40..=59 => ((b & c) | (b & d) | (c & d), K[2]),
                _ => (b ^ c ^ d, K[3]),
            };
            let t = a
                .rotate_left(5)
                .wrapping_add(f)
                .wrapping_add(e)
                .wrapping_add(k)
                .wrapping_add(wi);
            e = d;
            d = c;
            c = b.rotate_left(30);
            b = a;
            a = t;
        }

        self.state[0] = self.state[0].wrapping_add(a);
        self.state[1] = self.state[1].wrapping_add(b);
        self.state[2] = self.state[2].wrapping_add(c);
        self.state[3] = self.state[3].wrapping_add(d);
        self.state[4] = self.state[4].wrapping_add(e);
    }
}

impl Default for Sha0 {
    fn default() -> Self {
        Self::new()
    }
}
