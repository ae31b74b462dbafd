#![forbid(unsafe_code)]
//! On-dump format parsing for the boot and NAND storage structures.
//!
//! Pure parsing crate — no I/O, no crypto, no side effects. Parses byte
//! slices from dumps and flash images into typed Rust structures: ancast
//! container headers, ISFS superblocks (header/FAT/FST), embedded isfshax
//! redundancy info, PRSH handoff tables, SD master boot records and SEEPROM
//! board configuration, and serializes them back for the write paths.
//!
//! All firmware-side structures are big-endian; the MBR is little-endian.

pub mod ancast;
pub mod isfshax;
pub mod mbr;
pub mod prsh;
pub mod seeprom;
pub mod superblock;

pub use ancast::{AncastHeader, IosHeader};
pub use isfshax::{IsfshaxInfo, IsfshaxSlot};
pub use mbr::{Mbr, PartitionEntry};
pub use prsh::{BootInfo, PrshHeader, PrshRecord, PrstTrailer};
pub use seeprom::{BoardConfig, Boot1Params, Seeprom};
pub use superblock::{slot_cluster, FstEntry, FstKind, Superblock, SuperblockHeader};
