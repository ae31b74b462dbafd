#![forbid(unsafe_code)]
//! Persistent record store ("PRSH") handed between boot stages.
//!
//! A fixed RAM window at 0x10000400 carries a small name-to-pointer
//! table that survives warm resets: each stage scans the window for the
//! table, validates it, and either inherits it or rebuilds it from scratch
//! with a single bootstrap `boot_info` record. Records name memory blocks
//! owned by later stages (boot info, crash dumps, ramdisk bounds), so the
//! store itself never dereferences what they point at.
//!
//! On consoles fused for it the whole window is AES-CBC ciphered between
//! stages; [`PrshStore::init`] deciphers on entry and [`PrshStore::handoff`]
//! ciphers on exit, both no-ops when the fuse is clear.

pub mod store;

pub use store::{
    decrypt_region, encrypt_region, InitOutcome, PrshStore, PRSH_WINDOW_HEADER_OFFSET,
};
