use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::*;
use crate::api::{Error, Result};

/// A derived AES-256 partition key. Zeroised on drop, redacted in Debug.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PartitionKey {
    bytes: [u8; AES_KEYSIZE],
}

impl PartitionKey {
    pub(crate) fn from_bytes(bytes: [u8; AES_KEYSIZE]) -> PartitionKey { PartitionKey { bytes } }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEYSIZE] { &self.bytes }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "PartitionKey([REDACTED])") }
}

/// An open disk: a backing file with a verified header, plus the
/// process-local set of slots known to belong to some open partition.
///
/// The disk itself records nothing about partitions. There is no slot map and
/// no partition count on disk; the used-slot set exists only in memory and is
/// rebuilt by scanning whenever a partition is opened. Cloning a `Disk` is
/// cheap and shares both the file handle and that set, so every partition on
/// one disk allocates against the same bookkeeping.
#[derive(Clone, Debug)]
pub struct Disk {
    file: Arc<File>,
    block_size: u64,
    salt: [u8; SALT_LEN],
    used: Arc<Mutex<HashSet<i64>>>,
}

impl Disk {
    /// Initialise `file` as a fresh disk: header plus `block_count` slots of
    /// cryptographic noise. Every byte past the four magic bytes is
    /// indistinguishable from random data.
    pub fn create(file: File, block_size: u64, block_count: u64) -> Result<Disk> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::BlockSizeTooSmall { requested: block_size, minimum: MIN_BLOCK_SIZE });
        }
        file.write_all_at(&DISK_MAGIC, 0)?;
        file.write_all_at(&block_size.to_le_bytes(), BLOCK_SIZE_OFFSET)?;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        file.write_all_at(&salt, SALT_OFFSET)?;
        let area = block_count
            .checked_mul(block_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block area overflows u64"))?;
        fill_random(&file, HEADER_LEN, area)?;
        file.sync_all()?;
        log::info!("created disk: {} slots of {} bytes", block_count, block_size);
        Ok(Disk { file: Arc::new(file), block_size, salt, used: Arc::new(Mutex::new(HashSet::new())) })
    }

    pub fn create_at(path: &Path, block_size: u64, block_count: u64) -> Result<Disk> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Disk::create(file, block_size, block_count)
    }

    /// Re-initialise an existing file as a disk, deriving the slot count from
    /// the file's current length instead of extending it.
    pub fn create_in_file(file: File, block_size: u64) -> Result<Disk> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::BlockSizeTooSmall { requested: block_size, minimum: MIN_BLOCK_SIZE });
        }
        let len = file.metadata()?.len();
        let block_count = len.saturating_sub(HEADER_LEN) / block_size;
        Disk::create(file, block_size, block_count)
    }

    /// Open an existing disk read-write and verify its header.
    pub fn open(path: &Path) -> Result<Disk> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Disk::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Disk> {
        Disk::verify_header(&file)?;
        let mut raw = [0u8; 8];
        file.read_exact_at(&mut raw, BLOCK_SIZE_OFFSET)?;
        let block_size = u64::from_le_bytes(raw);
        if block_size < MIN_BLOCK_SIZE {
            // a header this malformed cannot address a single slot
            return Err(Error::BlockSizeTooSmall { requested: block_size, minimum: MIN_BLOCK_SIZE });
        }
        let mut salt = [0u8; SALT_LEN];
        file.read_exact_at(&mut salt, SALT_OFFSET)?;
        Ok(Disk { file: Arc::new(file), block_size, salt, used: Arc::new(Mutex::new(HashSet::new())) })
    }

    /// Re-check the header magic.
    pub fn verify(&self) -> Result<()> { Disk::verify_header(&self.file) }

    fn verify_header(file: &File) -> Result<()> {
        let mut magic = [0u8; DISK_MAGIC.len()];
        file.read_exact_at(&mut magic, 0)?;
        if magic != DISK_MAGIC {
            return Err(Error::BadDiskMagic);
        }
        Ok(())
    }

    pub fn block_size(&self) -> u64 { self.block_size }

    /// Number of slots, derived from the backing file's length.
    pub fn block_count(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        Ok(len.saturating_sub(HEADER_LEN) / self.block_size)
    }

    /// scrypt(N=32768, r=8, p=1, dkLen=32) over the passphrase and disk salt.
    pub fn derive_key(&self, passphrase: &str) -> Result<PartitionKey> {
        let params = scrypt::Params::new(15, 8, 1, AES_KEYSIZE).expect("fixed scrypt parameters");
        let mut key = [0u8; AES_KEYSIZE];
        scrypt::scrypt(passphrase.as_bytes(), &self.salt, &params, &mut key)
            .expect("fixed scrypt output length");
        Ok(PartitionKey::from_bytes(key))
    }

    /// Block codec bound to slot `index` under `key`.
    pub fn block_handle(&self, index: i64, key: &Arc<PartitionKey>) -> Result<Block> {
        let count = self.block_count()?;
        if index < 0 || index as u64 >= count {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slot {} out of range (disk has {})", index, count),
            )));
        }
        let base = HEADER_LEN + index as u64 * self.block_size;
        Ok(Block::new(Arc::clone(&self.file), index, base, self.block_size, Arc::clone(key)))
    }

    /// Find the partition owned by `passphrase`: scan every slot, keep the
    /// ones whose magic decrypts, and rebuild their chain.
    ///
    /// The scan is deliberately exhaustive and sequential. Skipping slots
    /// based on any stored hint would leak which slots are owned, which is
    /// exactly what the format exists to hide.
    pub fn open_partition(&self, passphrase: &str) -> Result<Partition> {
        let key = Arc::new(self.derive_key(passphrase)?);
        let count = self.block_count()?;
        let mut found = Vec::new();
        for index in 0..count as i64 {
            let mut block = self.block_handle(index, &key)?;
            if block.validate()? {
                found.push(block);
            }
        }
        if found.is_empty() {
            return Err(Error::NoSuchPartition);
        }
        log::debug!("passphrase owns {} of {} slots", found.len(), count);
        {
            let mut used = self.used.lock().unwrap();
            for block in &found {
                used.insert(block.index());
            }
        }
        Partition::assemble(self.clone(), key, found)
    }

    /// Create a partition of `block_count` blocks under `passphrase`, placing
    /// each block at a uniformly random unused slot.
    ///
    /// Random placement is the deniability property: sequential placement
    /// would let an observer correlate slot positions with creation order,
    /// and any clustering is a statistical tell.
    pub fn create_partition(&self, passphrase: &str, block_count: u64) -> Result<Partition> {
        if block_count == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a partition needs at least one block",
            )));
        }
        let key = Arc::new(self.derive_key(passphrase)?);
        let mut blocks = self.allocate_blocks(&key, block_count)?;
        let last = blocks.len() - 1;
        for i in 0..blocks.len() {
            let next = if i < last { blocks[i + 1].index() } else { TAIL };
            blocks[i].write_framing(next)?;
        }
        log::debug!("created partition with {} blocks", blocks.len());
        Ok(Partition::from_ordered(self.clone(), key, blocks))
    }

    /// Pick `n` distinct unused slots uniformly at random and mark them used.
    /// Holds the used-slot lock across the whole selection so concurrent
    /// creations on one disk cannot pick the same slot.
    pub(crate) fn allocate_blocks(&self, key: &Arc<PartitionKey>, n: u64) -> Result<Vec<Block>> {
        let total = self.block_count()?;
        let mut picked: Vec<i64> = Vec::with_capacity(n as usize);
        {
            let mut used = self.used.lock().unwrap();
            for _ in 0..n {
                if used.len() as u64 >= total {
                    for index in &picked {
                        used.remove(index);
                    }
                    return Err(Error::AllBlocksAllocated);
                }
                let index = loop {
                    let candidate = OsRng.gen_range(0..total) as i64;
                    if used.insert(candidate) {
                        break candidate;
                    }
                };
                picked.push(index);
            }
        }
        log::trace!("allocated slots {:?}", picked);
        picked.into_iter().map(|index| self.block_handle(index, key)).collect()
    }

    pub(crate) fn used_slots(&self) -> &Arc<Mutex<HashSet<i64>>> { &self.used }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
