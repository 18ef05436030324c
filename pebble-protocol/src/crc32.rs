//! STM32 hardware-compatible CRC32
//!
//! The watch checks PutBytes transfers with its CRC peripheral: polynomial
//! `0x04C11DB7`, initial value `0xFFFFFFFF`, no reflection, no final XOR,
//! fed 32-bit little-endian words. A trailing partial word is zero padded
//! and byte-reversed before it is fed.

const POLYNOMIAL: u32 = 0x04C1_1DB7;
const INITIAL: u32 = 0xFFFF_FFFF;

/// Incremental CRC over a byte stream that may arrive in arbitrary chunks
#[derive(Debug, Clone)]
pub struct Stm32Crc32 {
    value: u32,
    /// Bytes of an incomplete word carried to the next update
    leftover: Vec<u8>,
    length: u64,
}

impl Default for Stm32Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm32Crc32 {
    pub fn new() -> Self {
        Self {
            value: INITIAL,
            leftover: Vec::with_capacity(4),
            length: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.length += bytes.len() as u64;
        let mut rest = bytes;

        if !self.leftover.is_empty() {
            let needed = 4 - self.leftover.len();
            let take = needed.min(rest.len());
            self.leftover.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.leftover.len() < 4 {
                return;
            }
            let word = u32::from_le_bytes([
                self.leftover[0],
                self.leftover[1],
                self.leftover[2],
                self.leftover[3],
            ]);
            self.feed_word(word);
            self.leftover.clear();
        }

        let mut words = rest.chunks_exact(4);
        for chunk in &mut words {
            self.feed_word(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        self.leftover.extend_from_slice(words.remainder());
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// CRC of everything fed so far
    pub fn finalize(&self) -> u32 {
        if self.leftover.is_empty() {
            return self.value;
        }
        let mut padded = [0u8; 4];
        for (i, byte) in self.leftover.iter().rev().enumerate() {
            padded[i] = *byte;
        }
        let mut tail = self.clone();
        tail.feed_word(u32::from_le_bytes(padded));
        tail.value
    }

    fn feed_word(&mut self, word: u32) {
        let mut crc = self.value ^ word;
        for _ in 0..32 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
        }
        self.value = crc;
    }
}

/// CRC of a whole buffer
pub fn stm32_crc32(bytes: &[u8]) -> u32 {
    let mut crc = Stm32Crc32::new();
    crc.update(bytes);
    crc.finalize()
}
