#![forbid(unsafe_code)]
//! Checksums guarding journal frames.

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Clears all bytes fed so far.
    fn reset(&mut self);
    /// Feeds `bytes` into the running checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Checksum of everything fed since the last reset; feeding may continue.
    fn finalize(&self) -> u32;
}

/// CRC32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over a journal frame header (with its crc field zeroed) and payload.
pub fn frame_crc32(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}
