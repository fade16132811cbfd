#![forbid(unsafe_code)]

/// Incremental 32-bit checksum over a byte stream.
pub trait Checksum {
    /// Starts a new checksum.
    fn reset(&mut self);
    /// Feeds `bytes` into the running checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// Streaming CRC32C (Castagnoli), the checksum carried by btree blocks.
#[derive(Default)]
pub struct Crc32c {
    state: u32,
}

impl Checksum for Crc32c {
    fn reset(&mut self) {
        self.state = 0;
    }

    fn update(&mut self, bytes: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, bytes);
    }

    fn finalize(&self) -> u32 {
        self.state
    }
}

/// Checksums `block` as if the four bytes at `crc_offset` were zero.
pub fn block_crc32c(block: &[u8], crc_offset: usize) -> u32 {
    let mut c = Crc32c::default();
    c.update(&block[..crc_offset]);
    c.update(&[0u8; 4]);
    c.update(&block[crc_offset + 4..]);
    c.finalize()
}

/// Computes and stores the block checksum (little-endian) at `crc_offset`.
pub fn stamp_block_crc(block: &mut [u8], crc_offset: usize) {
    let crc = block_crc32c(block, crc_offset);
    block[crc_offset..crc_offset + 4].copy_from_slice(&crc.to_le_bytes());
}

/// Returns true when the stored checksum matches the block contents.
pub fn verify_block_crc(block: &[u8], crc_offset: usize) -> bool {
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&block[crc_offset..crc_offset + 4]);
    u32::from_le_bytes(stored) == block_crc32c(block, crc_offset)
}
