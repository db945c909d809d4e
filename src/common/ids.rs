//! Deterministic fingerprints over record sets.
//!
//! A dataset version stores the fingerprint of its member ids next to the
//! write-ahead marker so a replay can prove it is materializing the exact same
//! record set that was claimed.

/// 64-bit FNV-1a hash state.
#[derive(Copy, Clone, Debug)]
pub struct Fingerprint(u64);

impl Fingerprint {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Create a new hash state with the FNV offset basis.
    pub fn new() -> Self {
        Self(Self::OFFSET)
    }

    /// Feed bytes into the hash function.
    pub fn update(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 = (self.0 ^ u64::from(*b)).wrapping_mul(Self::PRIME);
        }
    }

    /// Finalise the hash and return a 16-character lowercase hex string.
    pub fn finish_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Fingerprint of an ordered id sequence.
    pub fn of_ids<I>(ids: I) -> String
    where
        I: IntoIterator<Item = i64>,
    {
        let mut hasher = Self::new();
        for id in ids {
            hasher.update(&id.to_le_bytes());
        }
        hasher.finish_hex()
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}
