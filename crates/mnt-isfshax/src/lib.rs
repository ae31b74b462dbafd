#![forbid(unsafe_code)]
//! Recovery superblock maintenance.
//!
//! The recovery payload installs four copies of its superblock in the
//! reserved generation window, each carrying an info block that names all
//! four physical slots and which one is current. The copies are marked bad
//! in the allocation table so the normal filesystem never allocates or
//! commits over them. This crate reads an install back the way the boot ROM
//! would pick it, grades the health of every copy, and runs the per-boot
//! refresh pass that rewrites worn or unreadable copies before flash wear
//! can take the whole ring down.

pub mod refresh;
pub mod status;

#[cfg(test)]
mod testutil;

pub use refresh::{refresh, RefreshEvent, RefreshOutcome};
pub use status::{
    read_installed, status, InstalledState, IsfshaxStatus, SlotCondition, SlotHealth,
};
