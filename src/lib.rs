//! # Sekura
//!
//! A plausibly-deniable encrypted block store. One backing file (a "disk")
//! holds any number of independent encrypted volumes ("partitions"), each
//! unlocked by its own passphrase. The disk records no partition list, no
//! slot map and no count: apart from four magic bytes at offset zero, the
//! whole file is indistinguishable from random noise. A user under coercion
//! can reveal one passphrase while every other partition remains not just
//! unreadable but undetectable.
//!
//! ## How the hiding works
//!
//! The disk is a header (magic, block size, salt) followed by fixed-size
//! block slots. On creation every slot is filled from the cryptographic RNG.
//! A partition claims slots at uniformly random positions and writes each one
//! as: a clear 16-byte IV, then an AES-256-CTR-encrypted magic, next-slot
//! link, and data region. Without the key, encrypted framing and stale noise
//! are the same thing; with it, a full scan of the disk finds exactly the
//! slots whose magic decrypts, and the links chain them into an ordered
//! volume. Deleting a partition overwrites its slots with fresh noise,
//! restoring them to the never-used state bit for bit.
//!
//! The passphrase is stretched with scrypt (N=32768, r=8, p=1) over the
//! disk's salt into the 32-byte partition key.
//!
//! ## What this format deliberately does not do
//!
//! There is **no authentication of ciphertext**. A MAC over owned slots would
//! distinguish them from unowned noise and destroy deniability, so an
//! attacker with write access can flip arbitrary bits undetected. Pair the
//! store with a filesystem or application layer that can tolerate (or
//! detect) corruption if that matters. There are also no filesystem
//! semantics, no snapshots, no journaling, and no defined behaviour for
//! overlapping concurrent writes to one partition.
//!
//! ## Crate layout
//!
//! [`backend`] holds the on-disk format: IV counter arithmetic, the per-slot
//! block codec, the [`Disk`] container and the [`Partition`] chain.
//! [`gateway`] adapts a partition to a host block-device mechanism.
//! [`protocol`] is the wire envelope spoken over the daemon's Unix socket by
//! the `sekura` CLI and the `sekurad` daemon.

pub mod api;
pub use api::*;
pub mod backend;
pub use backend::*;
pub mod gateway;
pub mod protocol;
