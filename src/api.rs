use std::fmt;
use std::io;

use crate::backend::UnorderedPartition;

/// Errors surfaced by the core.
///
/// Short reads and writes are not represented here: the positional I/O paths
/// return clamped `Ok(n)` counts instead, and `n` short of the request is the
/// end-of-data marker (see `Partition::read_at`).
#[derive(Debug)]
pub enum Error {
    /// The backing file's header magic did not match.
    BadDiskMagic,
    /// Disk creation asked for blocks too small to hold the framing.
    BlockSizeTooSmall { requested: u64, minimum: u64 },
    /// No slot on the disk decrypts under the key derived from the passphrase.
    NoSuchPartition,
    /// Blocks decrypt but their links do not form a single tail-terminated
    /// chain. The carried partition can still be deleted, nothing more.
    InvalidBlockStructure(UnorderedPartition),
    /// Every slot of the disk already belongs to an open partition.
    AllBlocksAllocated,
    /// The backing file failed underneath us; source preserved.
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadDiskMagic => write!(f, "invalid disk"),
            Error::BlockSizeTooSmall { requested, minimum } => {
                write!(f, "block size {} too small, must be at least {}", requested, minimum)
            }
            Error::NoSuchPartition => write!(f, "no partition with that passphrase"),
            Error::InvalidBlockStructure(_) => write!(f, "invalid block structure"),
            Error::AllBlocksAllocated => write!(f, "all blocks allocated"),
            Error::Io(e) => write!(f, "backing file error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error { Error::Io(e) }
}
