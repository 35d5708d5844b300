mod iv;
pub(crate) use iv::*;
mod block;
pub use block::*;
mod disk;
pub use disk::*;
mod partition;
pub use partition::*;

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use rand::rngs::OsRng;
use rand::RngCore;

/// First four bytes of every disk; the only plaintext structure in the file.
pub(crate) const DISK_MAGIC: [u8; 4] = [0x35, 0x53, 0x9C, 0xC2];
/// Plaintext block magic; only ever stored encrypted, so an owned slot is
/// indistinguishable from noise without the key.
pub(crate) const BLOCK_MAGIC: [u8; 8] = [0x90, 0x35, 0xCF, 0x2C, 0x39, 0x7F, 0x30, 0x8E];

// disk header geometry: magic | block_size (LE u64) | salt
pub(crate) const BLOCK_SIZE_OFFSET: u64 = DISK_MAGIC.len() as u64;
pub(crate) const SALT_OFFSET: u64 = BLOCK_SIZE_OFFSET + 8;
pub(crate) const SALT_LEN: usize = 8;
pub(crate) const HEADER_LEN: u64 = SALT_OFFSET + SALT_LEN as u64;

// slot geometry: IV (clear) | magic | next link | data, all but the IV
// encrypted under the partition key
pub(crate) const IV_LEN: usize = 16;
pub(crate) const BLOCK_MAGIC_OFFSET: u64 = IV_LEN as u64;
pub(crate) const NEXT_INDEX_OFFSET: u64 = BLOCK_MAGIC_OFFSET + BLOCK_MAGIC.len() as u64;
pub(crate) const DATA_OFFSET: u64 = NEXT_INDEX_OFFSET + 8;

/// Smallest admissible block size: the framing overhead plus one data byte.
pub const MIN_BLOCK_SIZE: u64 = DATA_OFFSET + 1;

pub(crate) const AES_KEYSIZE: usize = 32;
pub(crate) const CIPHER_BLOCK_LEN: u64 = 16;

/// Sentinel in the next-block link marking the tail of a chain.
pub(crate) const TAIL: i64 = -1;

/// Overwrite `len` bytes at `off` with output of the cryptographic RNG.
/// Used both to initialise a disk and to destroy blocks; the two must be
/// indistinguishable afterwards.
pub(crate) fn fill_random(file: &File, mut off: u64, len: u64) -> io::Result<()> {
    let mut chunk = vec![0u8; 64 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        OsRng.fill_bytes(&mut chunk[..n]);
        file.write_all_at(&chunk[..n], off)?;
        off += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}
