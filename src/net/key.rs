//! The opaque 16-word memory key packet exchanged between peers.

use crate::error::{Error, Result};

/// Discriminator carried in word 10 of [`MemoryKey`]. Only `Device` is
/// currently defined; other values are preserved opaquely so a future key
/// type does not have to break the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKeyType {
    Device,
    Other(u32),
}

impl From<u32> for MemoryKeyType {
    fn from(v: u32) -> Self {
        match v {
            0 => MemoryKeyType::Device,
            other => MemoryKeyType::Other(other),
        }
    }
}

impl From<MemoryKeyType> for u32 {
    fn from(v: MemoryKeyType) -> Self {
        match v {
            MemoryKeyType::Device => 0,
            MemoryKeyType::Other(other) => other,
        }
    }
}

/// Number of little-endian `u32` words in the wire key.
pub const MEMORY_KEY_WORDS: usize = 16;

/// The wire-format memory key: 16 little-endian `u32` words overlaying
/// `{address, size, regAddress, mrHandle, lkey, rkey, type, notifyRkey,
/// notifyAddr, reserved}`, bit-exact with the wire layout peers exchange.
///
/// `mr_handle` is opaque and always `0` once exported over the wire (it only
/// has meaning to the exporting process); `reserved` must be zero on both
/// sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemoryKey {
    pub address: u64,
    pub size: u64,
    pub reg_address: u64,
    pub lkey: u32,
    pub rkey: u32,
    pub ty: u32,
    pub notify_rkey: u32,
    pub notify_addr: u64,
}

impl MemoryKey {
    /// Pack into the bit-exact 16-word wire representation.
    pub fn to_words(&self) -> [u32; MEMORY_KEY_WORDS] {
        let mut w = [0u32; MEMORY_KEY_WORDS];
        put_u64(&mut w[0..2], self.address);
        put_u64(&mut w[2..4], self.size);
        put_u64(&mut w[4..6], self.reg_address);
        put_u64(&mut w[6..8], 0); // mrHandle, always 0 when exported
        w[8] = self.lkey;
        w[9] = self.rkey;
        w[10] = self.ty;
        w[11] = self.notify_rkey;
        put_u64(&mut w[12..14], self.notify_addr);
        // w[14..16] reserved, must be zero
        w
    }

    /// Unpack from the bit-exact 16-word wire representation.
    pub fn from_words(w: &[u32; MEMORY_KEY_WORDS]) -> Result<Self> {
        if w[14] != 0 || w[15] != 0 {
            return Err(Error::InvalidParam(
                "memory key reserved words must be zero".into(),
            ));
        }
        Ok(Self {
            address: get_u64(&w[0..2]),
            size: get_u64(&w[2..4]),
            reg_address: get_u64(&w[4..6]),
            lkey: w[8],
            rkey: w[9],
            ty: w[10],
            notify_rkey: w[11],
            notify_addr: get_u64(&w[12..14]),
        })
    }

    /// Serialize to the 64-byte little-endian wire buffer.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_bytes(&self) -> [u8; MEMORY_KEY_WORDS * 4] {
        let words = self.to_words();
        let mut buf = [0u8; MEMORY_KEY_WORDS * 4];
        for (i, word) in words.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        buf
    }

    /// Parse from a 64-byte little-endian wire buffer, as produced by
    /// [`query_memory_key`](crate::transport::Transport::query_memory_key)
    /// on the exporting peer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != MEMORY_KEY_WORDS * 4 {
            return Err(Error::InvalidParam(format!(
                "memory key must be {} bytes, got {}",
                MEMORY_KEY_WORDS * 4,
                buf.len()
            )));
        }
        let mut words = [0u32; MEMORY_KEY_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            *word = u32::from_le_bytes(b);
        }
        Self::from_words(&words)
    }

    /// Recover `(reg_address, size)` of the underlying memory region.
    /// Only defined for device MR keys (`ty == 0`).
    pub fn parse(&self) -> Result<(u64, u64)> {
        if self.ty != u32::from(MemoryKeyType::Device) {
            return Err(Error::InvalidParam(format!(
                "unsupported memory key type: {}",
                self.ty
            )));
        }
        Ok((self.reg_address, self.size))
    }
}

fn put_u64(words: &mut [u32], v: u64) {
    words[0] = (v & 0xFFFF_FFFF) as u32;
    words[1] = (v >> 32) as u32;
}

fn get_u64(words: &[u32]) -> u64 {
    (words[0] as u64) | ((words[1] as u64) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryKey {
        MemoryKey {
            address: 0xDEAD_BEEF_0000_1234,
            size: 1 << 20,
            reg_address: 0xDEAD_BEEF_0000_1234,
            lkey: 0x1111,
            rkey: 0x2222,
            ty: 0,
            notify_rkey: 0x3333,
            notify_addr: 0xABCD_EF01,
        }
    }

    #[test]
    fn round_trips_through_words() {
        let key = sample();
        let words = key.to_words();
        let back = MemoryKey::from_words(&words).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn round_trips_through_bytes() {
        let key = sample();
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), 64);
        let back = MemoryKey::from_bytes(&bytes).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn parse_yields_reg_address_and_size() {
        let key = sample();
        let (addr, size) = key.parse().unwrap();
        assert_eq!(addr, key.reg_address);
        assert_eq!(size, key.size);
    }

    #[test]
    fn rejects_nonzero_reserved_words() {
        let mut words = sample().to_words();
        words[15] = 1;
        assert!(MemoryKey::from_words(&words).is_err());
    }

    #[test]
    fn rejects_wrong_length_bytes() {
        assert!(MemoryKey::from_bytes(&[0u8; 10]).is_err());
    }
}
