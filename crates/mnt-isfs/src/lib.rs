#![forbid(unsafe_code)]
//! ISFS flash filesystem engine.
//!
//! Builds the filesystem out of three layers. The volume layer turns a NAND
//! bank or redirected sector window into cluster-granular reads and writes,
//! applying AES-CBC, the spare-area HMAC copies, and optional readback
//! verification. The superblock layer scans the reserved slot ring for the
//! newest generation, verifies it, and rotates commits across the ring. The
//! filesystem layer walks the FST over that buffered superblock for path
//! lookup, file reads, directory iteration, and unlink. A small registry
//! tracks the four addressable volumes and routes `volume:/path` names.

pub mod fs;
pub mod store;
pub mod superblock;
pub mod volume;

#[cfg(test)]
mod testutil;

pub use fs::{DirHandle, FileHandle, Filesystem};
pub use store::{parse_volume_path, VolumeStore};
pub use superblock::{
    commit_super, find_super, load_super, load_super_range, read_super, write_super, FoundSuper,
    MountState,
};
pub use volume::{
    HmacSeed, ReadStatus, Volume, VolumeDevice, VolumeFlags, VolumeId, WriteStatus,
};
