#![forbid(unsafe_code)]
//! Unified error type for the minute storage core.
//!
//! Every layer (NAND devices, volume I/O, superblock management, redundancy
//! refresh, ancast loading, PRSH) reports through [`MinuteError`], so callers
//! can match on the precise failure family instead of a collapsed "ok/fail".
//!
//! # Code families
//!
//! The flash and redundancy variants keep the stable numeric codes used in
//! logs and machine-readable CLI output:
//!
//! | variant | code | meaning |
//! |---------|------|---------|
//! | `Write` | -0x10 | page program failed |
//! | `Read` | -0x20 | page/sector read failed |
//! | `Erase` | -0x30 | block erase failed |
//! | `Hmac` | -0x40 | neither stored HMAC copy matched |
//! | `Readback` | -0x50 | post-write verification mismatch |
//! | `Ecc` | -0x60 | uncorrectable ECC on at least one page |
//! | `CurrentGenNotLatest` | -100 | another slot carries a newer generation |
//! | `CurrentSlotBad` | -200 | the booted slot no longer reads back |
//! | `NoRedundancy` | -300 | every candidate slot failed or is bad |
//! | `GenerationRangeExhausted` | -0x400 | reserved generation window used up |
//!
//! Success-with-annotation states (ECC corrected, one-of-two HMAC copies
//! matched) are **not** errors; they travel in `Ok` payloads of the volume
//! layer. Protocol-violation variants are deliberately distinct from media
//! failures so "flash is wearing out" is never conflated with "a bug".

use mnt_types::{ClusterIndex, PageIndex, ParseError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MinuteError>;

#[derive(Debug, Error)]
pub enum MinuteError {
    /// Host I/O failure (image files, SD-card backing files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural parse failure of an on-disk/on-flash structure.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Device/format-level misuse (bounds, geometry, unsupported layout).
    #[error("format error: {0}")]
    Format(String),

    /// Page program failed.
    #[error("NAND write failed at page {page}")]
    Write { page: PageIndex },

    /// Page or sector read failed.
    #[error("read failed at page {page}")]
    Read { page: PageIndex },

    /// Erase-block erase failed.
    #[error("block erase failed at page {page}")]
    Erase { page: PageIndex },

    /// Neither stored HMAC copy matched the computed digest.
    #[error("HMAC mismatch for cluster span starting at {cluster}")]
    Hmac { cluster: ClusterIndex },

    /// Post-write readback compared unequal.
    #[error("readback mismatch at page {page}")]
    Readback { page: PageIndex },

    /// Uncorrectable ECC on at least one page of the request.
    #[error("uncorrectable ECC in cluster {cluster}")]
    Ecc { cluster: ClusterIndex },

    /// Computed image hash differs from the one carried in the header.
    #[error("body hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },

    /// A redundancy slot carries a generation newer than the booted one.
    #[error("current generation {current:#x} is not the newest (saw {seen:#x})")]
    CurrentGenNotLatest { current: u32, seen: u32 },

    /// The currently-booted slot no longer reads back.
    #[error("currently-booted superblock slot {slot} failed to read")]
    CurrentSlotBad { slot: u8 },

    /// All redundancy slots are bad or failed to take a rewrite.
    #[error("superblock redundancy exhausted")]
    NoRedundancy,

    /// The reserved generation window has no usable values left.
    #[error("reserved generation range exhausted at {generation:#x}")]
    GenerationRangeExhausted { generation: u32 },

    /// Named object (FST path, PRSH record) does not exist.
    #[error("not found: {name}")]
    NotFound { name: String },

    /// Path component resolved to a file where a directory was required.
    #[error("not a directory: {name}")]
    NotADirectory { name: String },

    /// Path resolved to a directory where a file was required.
    #[error("not a file: {name}")]
    NotAFile { name: String },

    /// Operation requires a mounted volume.
    #[error("volume {volume} is not mounted")]
    NotMounted { volume: &'static str },

    /// PRSH record table has no free entries.
    #[error("record table full")]
    RecordTableFull,

    /// Invalid configuration combination (redNAND setup).
    #[error("configuration rejected: {0}")]
    Config(String),
}

impl MinuteError {
    /// True for flash/media failures (wear, bad blocks, transport).
    #[must_use]
    pub fn is_media(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Write { .. }
            | Self::Read { .. }
            | Self::Erase { .. }
            | Self::Readback { .. }
            | Self::Ecc { .. } => true,
            Self::Parse(_)
            | Self::Format(_)
            | Self::Hmac { .. }
            | Self::HashMismatch { .. }
            | Self::CurrentGenNotLatest { .. }
            | Self::CurrentSlotBad { .. }
            | Self::NoRedundancy
            | Self::GenerationRangeExhausted { .. }
            | Self::NotFound { .. }
            | Self::NotADirectory { .. }
            | Self::NotAFile { .. }
            | Self::NotMounted { .. }
            | Self::RecordTableFull
            | Self::Config(_) => false,
        }
    }

    /// True for cryptographic integrity failures.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Hmac { .. } | Self::HashMismatch { .. } => true,
            Self::Io(_)
            | Self::Parse(_)
            | Self::Format(_)
            | Self::Write { .. }
            | Self::Read { .. }
            | Self::Erase { .. }
            | Self::Readback { .. }
            | Self::Ecc { .. }
            | Self::CurrentGenNotLatest { .. }
            | Self::CurrentSlotBad { .. }
            | Self::NoRedundancy
            | Self::GenerationRangeExhausted { .. }
            | Self::NotFound { .. }
            | Self::NotADirectory { .. }
            | Self::NotAFile { .. }
            | Self::NotMounted { .. }
            | Self::RecordTableFull
            | Self::Config(_) => false,
        }
    }

    /// True for "should never happen" invariant violations, as opposed to
    /// expected wear-and-tear failures.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::CurrentGenNotLatest { .. } | Self::CurrentSlotBad { .. } => true,
            Self::Io(_)
            | Self::Parse(_)
            | Self::Format(_)
            | Self::Write { .. }
            | Self::Read { .. }
            | Self::Erase { .. }
            | Self::Hmac { .. }
            | Self::Readback { .. }
            | Self::Ecc { .. }
            | Self::HashMismatch { .. }
            | Self::NoRedundancy
            | Self::GenerationRangeExhausted { .. }
            | Self::NotFound { .. }
            | Self::NotADirectory { .. }
            | Self::NotAFile { .. }
            | Self::NotMounted { .. }
            | Self::RecordTableFull
            | Self::Config(_) => false,
        }
    }

    /// True for terminal resource exhaustion (no retry will help).
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        match self {
            Self::NoRedundancy
            | Self::GenerationRangeExhausted { .. }
            | Self::RecordTableFull => true,
            Self::Io(_)
            | Self::Parse(_)
            | Self::Format(_)
            | Self::Write { .. }
            | Self::Read { .. }
            | Self::Erase { .. }
            | Self::Hmac { .. }
            | Self::Readback { .. }
            | Self::Ecc { .. }
            | Self::HashMismatch { .. }
            | Self::CurrentGenNotLatest { .. }
            | Self::CurrentSlotBad { .. }
            | Self::NotFound { .. }
            | Self::NotADirectory { .. }
            | Self::NotAFile { .. }
            | Self::NotMounted { .. }
            | Self::Config(_) => false,
        }
    }

    /// Stable numeric code for logs and machine-readable output.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(_) => -0x01,
            Self::Parse(_) => -0x02,
            Self::Format(_) => -0x03,
            Self::Write { .. } => -0x10,
            Self::Read { .. } => -0x20,
            Self::Erase { .. } => -0x30,
            Self::Hmac { .. } => -0x40,
            Self::Readback { .. } => -0x50,
            Self::Ecc { .. } => -0x60,
            Self::HashMismatch { .. } => -0x04,
            Self::CurrentGenNotLatest { .. } => -100,
            Self::CurrentSlotBad { .. } => -200,
            Self::NoRedundancy => -300,
            Self::GenerationRangeExhausted { .. } => -0x400,
            Self::NotFound { .. } => -0x05,
            Self::NotADirectory { .. } => -0x06,
            Self::NotAFile { .. } => -0x07,
            Self::NotMounted { .. } => -0x08,
            Self::RecordTableFull => -0x09,
            Self::Config(_) => -0x0A,
        }
    }
}
