use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;

use super::*;
use crate::api::Result;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Handle onto one slot of the block area.
///
/// Everything past the clear-stored IV is encrypted with AES-256-CTR keyed on
/// the partition key; the counter for intra-slot offset `o` is the slot IV
/// advanced by `o / 16`, so any byte range can be ciphered without touching
/// its neighbours. The IV is loaded lazily: on an unowned slot it is just
/// noise, and `validate` then fails exactly as it should.
#[derive(Debug)]
pub struct Block {
    file: Arc<File>,
    index: i64,
    base: u64,
    size: u64,
    key: Arc<PartitionKey>,
    iv: Option<[u8; IV_LEN]>,
    next: Option<i64>,
}

impl Block {
    pub(crate) fn new(file: Arc<File>, index: i64, base: u64, size: u64, key: Arc<PartitionKey>) -> Block {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        Block { file, index, base, size, key, iv: None, next: None }
    }

    pub fn index(&self) -> i64 { self.index }

    /// Capacity of the data region.
    pub fn data_size(&self) -> u64 { self.size - DATA_OFFSET }

    fn load_iv(&mut self) -> Result<[u8; IV_LEN]> {
        if let Some(iv) = self.iv {
            return Ok(iv);
        }
        let mut iv = [0u8; IV_LEN];
        self.file.read_exact_at(&mut iv, self.base)?;
        self.iv = Some(iv);
        Ok(iv)
    }

    fn keystream(&mut self, aligned: u64) -> Result<Aes256Ctr> {
        let mut civ = self.load_iv()?;
        increment(&mut civ, aligned / CIPHER_BLOCK_LEN);
        Ok(Aes256Ctr::new(GenericArray::from_slice(self.key.as_bytes()), GenericArray::from_slice(&civ)))
    }

    /// Positional read in intra-slot coordinates (`off >= 16`; the IV field
    /// never enters the keystream). Clamps strictly to the end of the slot;
    /// a short count marks the end of the block, not an error.
    fn read_ciphered(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        debug_assert!(off >= BLOCK_MAGIC_OFFSET);
        if off >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((self.size - off) as usize);
        let aligned = off - off % CIPHER_BLOCK_LEN;
        let skew = (off - aligned) as usize;
        let mut scratch = vec![0u8; skew + n];
        self.file.read_exact_at(&mut scratch, self.base + aligned)?;
        let mut ctr = self.keystream(aligned)?;
        ctr.apply_keystream(&mut scratch);
        buf[..n].copy_from_slice(&scratch[skew..]);
        Ok(n)
    }

    /// Write counterpart of `read_ciphered`. Only the requested bytes are
    /// rewritten: the keystream covering the skew before an unaligned start
    /// is generated and discarded, which keeps partial cipher blocks
    /// consistent without a read-modify cycle.
    fn write_ciphered(&mut self, buf: &[u8], off: u64) -> Result<usize> {
        debug_assert!(off >= BLOCK_MAGIC_OFFSET);
        if off >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((self.size - off) as usize);
        let aligned = off - off % CIPHER_BLOCK_LEN;
        let skew = (off - aligned) as usize;
        let mut scratch = vec![0u8; skew + n];
        scratch[skew..].copy_from_slice(&buf[..n]);
        let mut ctr = self.keystream(aligned)?;
        ctr.apply_keystream(&mut scratch);
        self.file.write_all_at(&scratch[skew..], self.base + off)?;
        Ok(n)
    }

    /// Check whether the slot decrypts to the block magic under our key.
    /// A mismatch is the normal signal during discovery that the slot is not
    /// ours; only backing I/O failures are errors here.
    pub fn validate(&mut self) -> Result<bool> {
        let mut magic = [0u8; BLOCK_MAGIC.len()];
        self.read_ciphered(&mut magic, BLOCK_MAGIC_OFFSET)?;
        if magic == BLOCK_MAGIC {
            Ok(true)
        } else {
            log::trace!("slot {} does not decrypt under this key", self.index);
            Ok(false)
        }
    }

    /// Claim the slot: persist a fresh IV in the clear, then the encrypted
    /// magic and next-block link. Overwrites any prior framing.
    pub fn write_framing(&mut self, next: i64) -> Result<()> {
        if self.iv.is_none() {
            let mut iv = [0u8; IV_LEN];
            OsRng.fill_bytes(&mut iv);
            self.iv = Some(iv);
        }
        let iv = self.iv.unwrap();
        self.file.write_all_at(&iv, self.base)?;
        self.write_ciphered(&BLOCK_MAGIC, BLOCK_MAGIC_OFFSET)?;
        self.set_next_block_index(next)
    }

    pub fn get_next_block_index(&mut self) -> Result<i64> {
        if let Some(next) = self.next {
            return Ok(next);
        }
        let mut raw = [0u8; 8];
        self.read_ciphered(&mut raw, NEXT_INDEX_OFFSET)?;
        let next = i64::from_le_bytes(raw);
        self.next = Some(next);
        Ok(next)
    }

    pub fn set_next_block_index(&mut self, index: i64) -> Result<()> {
        self.write_ciphered(&index.to_le_bytes(), NEXT_INDEX_OFFSET)?;
        self.next = Some(index);
        Ok(())
    }

    /// Link value as last read or written; `assemble` primes this for every
    /// discovered block before ordering them.
    pub(crate) fn cached_next(&self) -> Option<i64> { self.next }

    /// Positional read from the data region (`off` in `0..data_size`).
    /// Returns the clamped count; short means the request ran off the end of
    /// this block.
    pub fn read_data(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        if off >= self.data_size() {
            return Ok(0);
        }
        self.read_ciphered(buf, off + DATA_OFFSET)
    }

    pub fn write_data(&mut self, buf: &[u8], off: u64) -> Result<usize> {
        if off >= self.data_size() {
            return Ok(0);
        }
        self.write_ciphered(buf, off + DATA_OFFSET)
    }

    /// Return the slot to noise. Afterwards it is indistinguishable from a
    /// slot that was never owned.
    pub(crate) fn erase(&mut self) -> Result<()> {
        fill_random(&self.file, self.base, self.size)?;
        self.iv = None;
        self.next = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SIZE: u64 = MIN_BLOCK_SIZE + 63; // 64-byte data region

    fn test_block() -> Block {
        let file = tempfile::tempfile().unwrap();
        file.set_len(TEST_SIZE).unwrap();
        let mut key = [0u8; AES_KEYSIZE];
        OsRng.fill_bytes(&mut key);
        Block::new(Arc::new(file), 0, 0, TEST_SIZE, Arc::new(PartitionKey::from_bytes(key)))
    }

    #[test]
    fn framing_round_trip() {
        let mut b = test_block();
        assert!(!b.validate().unwrap(), "unframed slot must not validate");
        b.write_framing(TAIL).unwrap();
        assert!(b.validate().unwrap());
        assert_eq!(b.get_next_block_index().unwrap(), TAIL);
        b.set_next_block_index(7).unwrap();
        assert_eq!(b.get_next_block_index().unwrap(), 7);
    }

    #[test]
    fn data_round_trip() {
        let mut b = test_block();
        b.write_framing(TAIL).unwrap();
        assert_eq!(b.write_data(b"a", 0).unwrap(), 1);
        let mut out = [0u8; 1];
        assert_eq!(b.read_data(&mut out, 0).unwrap(), 1);
        assert_eq!(&out, b"a");

        // arbitrary offset, spanning a cipher-block boundary
        let payload = b"0123456789abcdefghij";
        assert_eq!(b.write_data(payload, 13).unwrap(), payload.len());
        let mut out = vec![0u8; payload.len()];
        assert_eq!(b.read_data(&mut out, 13).unwrap(), payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn cipher_blocks_are_independent() {
        let mut b = test_block();
        b.write_framing(TAIL).unwrap();
        let mut pattern = Vec::new();
        pattern.extend_from_slice(&[b'a'; 16]);
        pattern.extend_from_slice(&[b'b'; 16]);
        assert_eq!(b.write_data(&pattern, 0).unwrap(), 32);

        let mut first = [0u8; 16];
        b.read_data(&mut first, 0).unwrap();
        assert_eq!(first, [b'a'; 16]);
        let mut second = [0u8; 16];
        b.read_data(&mut second, 16).unwrap();
        assert_eq!(second, [b'b'; 16]);
        // unaligned slice straddling nothing but the second cipher block
        let mut middle = [0u8; 8];
        b.read_data(&mut middle, 20).unwrap();
        assert_eq!(middle, [b'b'; 8]);
    }

    #[test]
    fn framing_survives_data_writes() {
        let mut b = test_block();
        b.write_framing(5).unwrap();
        for i in 0..b.data_size() {
            b.write_data(&[i as u8], i).unwrap();
        }
        assert!(b.validate().unwrap());
        assert_eq!(b.get_next_block_index().unwrap(), 5);
    }

    #[test]
    fn reads_and_writes_clamp_to_the_slot() {
        let mut b = test_block();
        b.write_framing(TAIL).unwrap();
        let data_size = b.data_size() as usize;

        let mut buf = vec![0u8; data_size + 10];
        assert_eq!(b.read_data(&mut buf, 0).unwrap(), data_size);
        assert_eq!(b.write_data(&buf, 0).unwrap(), data_size);
        assert_eq!(b.read_data(&mut buf, b.data_size()).unwrap(), 0);
        assert_eq!(b.read_data(&mut buf, u64::MAX).unwrap(), 0);

        // a clamped write must still land: fill the tail byte and check it
        assert_eq!(b.write_data(&[0xEE, 0xEE], b.data_size() - 1).unwrap(), 1);
        let mut tail = [0u8; 1];
        b.read_data(&mut tail, b.data_size() - 1).unwrap();
        assert_eq!(tail, [0xEE]);
    }

    #[test]
    fn reframing_through_a_fresh_handle_draws_a_fresh_iv() {
        let mut b = test_block();
        b.write_framing(TAIL).unwrap();
        let iv1 = b.iv.unwrap();
        b.iv = None; // a new handle onto the same slot also starts empty
        b.next = None;
        b.write_framing(TAIL).unwrap();
        assert_ne!(b.iv.unwrap(), iv1);
        assert!(b.validate().unwrap());
    }
}
