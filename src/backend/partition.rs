use std::io;
use std::sync::Arc;

use super::*;
use crate::api::{Error, Result};

/// An ordered chain of blocks unlocked by one passphrase, presenting the
/// concatenation of the blocks' data regions as a flat byte space.
///
/// A partition holds a clone of its `Disk`: a non-owning handle onto the
/// shared file and used-slot set, not a parent pointer. Overlapping
/// concurrent writes through separate handles race at slot granularity and
/// have no defined result; callers serialise access.
#[derive(Debug)]
pub struct Partition {
    disk: Disk,
    key: Arc<PartitionKey>,
    blocks: Vec<Block>,
}

impl Partition {
    pub(crate) fn from_ordered(disk: Disk, key: Arc<PartitionKey>, blocks: Vec<Block>) -> Partition {
        Partition { disk, key, blocks }
    }

    /// Rebuild the chain order from the next-block links: the tail is the
    /// block linking to −1, its predecessor the block linking to the tail's
    /// slot, and so on until every discovered block is placed.
    ///
    /// If the links do not close into a single chain (two partitions sharing
    /// a passphrase by collision, or a crash mid-delete), the blocks are
    /// handed back inside the error for destruction only.
    pub(crate) fn assemble(disk: Disk, key: Arc<PartitionKey>, mut found: Vec<Block>) -> Result<Partition> {
        for block in found.iter_mut() {
            block.get_next_block_index()?;
        }
        let mut tail_first: Vec<Block> = Vec::with_capacity(found.len());
        while !found.is_empty() {
            let want = tail_first.last().map(|b| b.index()).unwrap_or(TAIL);
            match found.iter().position(|b| b.cached_next() == Some(want)) {
                Some(pos) => tail_first.push(found.swap_remove(pos)),
                None => {
                    log::warn!(
                        "{} blocks decrypt but their links do not form a chain",
                        found.len() + tail_first.len()
                    );
                    found.append(&mut tail_first);
                    return Err(Error::InvalidBlockStructure(UnorderedPartition {
                        inner: Partition { disk, key, blocks: found },
                    }));
                }
            }
        }
        tail_first.reverse();
        Ok(Partition { disk, key, blocks: tail_first })
    }

    pub fn block_count(&self) -> usize { self.blocks.len() }

    /// Total byte capacity across the chain.
    pub fn data_size(&self) -> u64 { self.blocks.iter().map(|b| b.data_size()).sum() }

    fn data_size_per_block(&self) -> u64 { self.disk.block_size() - DATA_OFFSET }

    /// Read into `buf` from logical offset `off`. Returns the byte count;
    /// fewer than `buf.len()` means the request ran past the end of the
    /// partition. Byte order is left-to-right across the chain.
    pub fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        let per_block = self.data_size_per_block();
        if off / per_block >= self.blocks.len() as u64 {
            return Ok(0);
        }
        let mut bn = (off / per_block) as usize;
        let mut bo = off % per_block;
        let mut done = 0;
        while done < buf.len() && bn < self.blocks.len() {
            done += self.blocks[bn].read_data(&mut buf[done..], bo)?;
            bn += 1;
            bo = 0;
        }
        Ok(done)
    }

    /// Write counterpart of `read_at`: a block's short count moves on to the
    /// next block; real errors surface immediately.
    pub fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize> {
        let per_block = self.data_size_per_block();
        if off / per_block >= self.blocks.len() as u64 {
            return Ok(0);
        }
        let mut bn = (off / per_block) as usize;
        let mut bo = off % per_block;
        let mut done = 0;
        while done < buf.len() && bn < self.blocks.len() {
            done += self.blocks[bn].write_data(&buf[done..], bo)?;
            bn += 1;
            bo = 0;
        }
        Ok(done)
    }

    /// Destroy the partition: overwrite every owned slot with fresh noise and
    /// release it. Afterwards the slots are indistinguishable from
    /// never-initialised disk, and the data is gone.
    ///
    /// Not atomic across blocks: a crash mid-way leaves blocks whose magic
    /// still validates but whose chain no longer reconstructs; the next open
    /// reports InvalidBlockStructure and the remains can only be deleted.
    pub fn delete(mut self) -> Result<()> {
        let used = Arc::clone(self.disk.used_slots());
        for block in self.blocks.iter_mut() {
            block.erase()?;
            used.lock().unwrap().remove(&block.index());
        }
        log::debug!("deleted partition ({} slots returned to noise)", self.blocks.len());
        self.disk.sync()
    }

    /// Grow or shrink the chain to `block_count` blocks. Data in the
    /// surviving prefix is untouched.
    pub fn resize(&mut self, block_count: u64) -> Result<()> {
        let current = self.blocks.len() as u64;
        if block_count == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot resize to zero blocks; delete the partition instead",
            )));
        }
        if block_count > current {
            self.grow(block_count - current)
        } else if block_count < current {
            self.shrink(block_count)
        } else {
            Ok(())
        }
    }

    fn grow(&mut self, add: u64) -> Result<()> {
        let mut fresh = self.disk.allocate_blocks(&self.key, add)?;
        let first_new = fresh[0].index();
        self.blocks.last_mut().expect("chain is never empty").set_next_block_index(first_new)?;
        let last = fresh.len() - 1;
        for i in 0..fresh.len() {
            let next = if i < last { fresh[i + 1].index() } else { TAIL };
            fresh[i].write_framing(next)?;
        }
        self.blocks.append(&mut fresh);
        Ok(())
    }

    fn shrink(&mut self, keep: u64) -> Result<()> {
        let used = Arc::clone(self.disk.used_slots());
        for mut block in self.blocks.drain(keep as usize..) {
            block.erase()?;
            used.lock().unwrap().remove(&block.index());
        }
        self.blocks.last_mut().expect("chain is never empty").set_next_block_index(TAIL)
    }

    /// Flush the backing file.
    pub fn close(&self) -> Result<()> { self.disk.sync() }
}

/// The rescue state of a partition whose blocks were found but whose links do
/// not reconstruct a chain. The only thing it is good for is destroying the
/// remains; the type offers nothing else.
#[derive(Debug)]
pub struct UnorderedPartition {
    inner: Partition,
}

impl UnorderedPartition {
    pub fn block_count(&self) -> usize { self.inner.block_count() }

    pub fn delete(self) -> Result<()> { self.inner.delete() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_disk(block_size: u64, block_count: u64) -> Disk {
        Disk::create(tempfile::tempfile().unwrap(), block_size, block_count).unwrap()
    }

    #[test]
    fn discovery_orders_the_chain() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 31, 16);
        let created = disk.create_partition("secret", 5).unwrap();
        let created_order: Vec<i64> = created.blocks.iter().map(|b| b.index()).collect();

        let reopened = disk.open_partition("secret").unwrap();
        let reopened_order: Vec<i64> = reopened.blocks.iter().map(|b| b.index()).collect();
        assert_eq!(created_order, reopened_order);
    }

    #[test]
    fn wrong_passphrase_finds_nothing() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 31, 8);
        disk.create_partition("right", 3).unwrap();
        match disk.open_partition("wrong") {
            Err(Error::NoSuchPartition) => (),
            other => panic!("expected NoSuchPartition, got {:?}", other),
        }
    }

    #[test]
    fn io_spans_blocks() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 15, 8); // 16-byte data regions
        let mut part = disk.create_partition("secret", 3).unwrap();
        assert_eq!(part.data_size(), 48);

        let payload: Vec<u8> = (0u8..40).collect();
        assert_eq!(part.write_at(&payload, 3).unwrap(), payload.len());
        let mut out = vec![0u8; payload.len()];
        assert_eq!(part.read_at(&mut out, 3).unwrap(), payload.len());
        assert_eq!(out, payload);

        // short read at the end of the chain, empty read past it
        let mut out = vec![0u8; 20];
        assert_eq!(part.read_at(&mut out, 40).unwrap(), 8);
        assert_eq!(part.read_at(&mut out, 48).unwrap(), 0);
        assert_eq!(part.write_at(&out, 48).unwrap(), 0);
    }

    #[test]
    fn broken_chain_is_delete_only() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 31, 8);
        let mut part = disk.create_partition("secret", 3).unwrap();
        // sever the chain: point the head at itself
        let head_index = part.blocks[0].index();
        part.blocks[0].set_next_block_index(head_index).unwrap();
        drop(part);

        let rescued = match disk.open_partition("secret") {
            Err(Error::InvalidBlockStructure(unordered)) => unordered,
            other => panic!("expected InvalidBlockStructure, got {:?}", other),
        };
        assert_eq!(rescued.block_count(), 3);
        rescued.delete().unwrap();
        match disk.open_partition("secret") {
            Err(Error::NoSuchPartition) => (),
            other => panic!("expected NoSuchPartition after delete, got {:?}", other),
        }
    }

    #[test]
    fn delete_releases_slots() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 31, 4);
        let part = disk.create_partition("secret", 4).unwrap();
        assert_eq!(disk.used_slots().lock().unwrap().len(), 4);
        part.delete().unwrap();
        assert_eq!(disk.used_slots().lock().unwrap().len(), 0);
    }

    #[test]
    fn resize_preserves_the_prefix() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 15, 16); // 16-byte data regions
        let mut part = disk.create_partition("secret", 2).unwrap();
        let payload = vec![0xAB; 32];
        assert_eq!(part.write_at(&payload, 0).unwrap(), 32);

        part.resize(5).unwrap();
        assert_eq!(part.block_count(), 5);
        assert_eq!(part.data_size(), 80);
        let mut out = vec![0u8; 32];
        assert_eq!(part.read_at(&mut out, 0).unwrap(), 32);
        assert_eq!(out, payload);

        part.resize(3).unwrap();
        assert_eq!(part.data_size(), 48);
        let mut out = vec![0u8; 32];
        assert_eq!(part.read_at(&mut out, 0).unwrap(), 32);
        assert_eq!(out, payload);
        part.close().unwrap();

        // the resized chain must survive a reopen
        let mut reopened = disk.open_partition("secret").unwrap();
        assert_eq!(reopened.block_count(), 3);
        let mut out = vec![0u8; 32];
        assert_eq!(reopened.read_at(&mut out, 0).unwrap(), 32);
        assert_eq!(out, payload);
    }

    #[test]
    fn resize_to_zero_is_refused() {
        let disk = temp_disk(MIN_BLOCK_SIZE + 31, 4);
        let mut part = disk.create_partition("secret", 2).unwrap();
        assert!(part.resize(0).is_err());
        assert_eq!(part.block_count(), 2);
    }
}
