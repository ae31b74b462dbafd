#![forbid(unsafe_code)]
//! Raw NAND device model.
//!
//! The `NandDevice` trait gives page-granular access to an SLC bank with
//! its out-of-band spare area; `SectorDevice` covers 512-byte sector
//! storage such as an SD card. On top sit the ECC engine shared by every
//! page path, file- and memory-backed device implementations, redirected
//! NAND (partition discovery, config parsing, cluster windowing), the
//! pipelined sector copier, and raw dump/restore image handling.

pub mod device;
pub mod dump;
pub mod ecc;
pub mod file;
pub mod mem;
pub mod pipeline;
pub mod rednand;

pub use device::{program_page_ecc, NandBank, NandDevice, SectorDevice};
pub use dump::{copy_nand_to_sectors, dump_raw, restore_raw, DumpStats, RestoreStats};
pub use ecc::{blank_spare, calc_subblock_ecc, correct_page, finalize_spare, EccStatus};
pub use file::{FileNand, FileSectorDevice};
pub use mem::{MemNand, MemSectorDevice};
pub use pipeline::{pipelined_copy, CopyStats};
pub use rednand::{
    apply_legacy_layout, apply_settings, discover_partitions, parse_settings, plan_legacy_layout,
    LegacyPlan, RedNand, RedPartition, RednandLayout, RednandPartitions, RednandSettings,
};
