#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── NAND geometry ───────────────────────────────────────────────────────────

/// Bytes of user data per NAND page.
pub const PAGE_SIZE: usize = 2048;
/// Bytes of spare (out-of-band) area per NAND page.
pub const PAGE_SPARE_SIZE: usize = 64;
/// Total pages per NAND bank.
pub const NAND_PAGE_COUNT: u32 = 0x40000;
/// Pages per erase block.
pub const BLOCK_PAGES: u32 = 64;
/// Clusters per erase block.
pub const BLOCK_CLUSTERS: u16 = 8;
/// Pages per filesystem cluster.
pub const CLUSTER_PAGES: u32 = 8;
/// Bytes of user data per cluster.
pub const CLUSTER_SIZE: usize = PAGE_SIZE * CLUSTER_PAGES as usize;
/// Total clusters per NAND bank.
pub const CLUSTER_COUNT: u16 = (NAND_PAGE_COUNT / CLUSTER_PAGES) as u16;

/// SD/MMC sector size in bytes.
pub const SECTOR_SIZE: usize = 512;
/// SD sectors covering one cluster of data.
pub const SECTORS_PER_CLUSTER: u32 = (CLUSTER_SIZE / SECTOR_SIZE) as u32;

/// NAND bank carrying the vWii (Wii-compatibility) filesystem.
pub const NAND_BANK_SLCCMPT: u32 = 0x0000_0001;
/// NAND bank carrying the Wii U filesystem.
pub const NAND_BANK_SLC: u32 = 0x0000_0002;

// ── ECC layout ──────────────────────────────────────────────────────────────

/// Each page is protected as 4 independent 512-byte codeword sub-blocks.
pub const ECC_SUBBLOCKS: usize = 4;
/// Bytes covered by one ECC codeword.
pub const ECC_SUBBLOCK_SIZE: usize = 512;
/// Stored ECC bytes per page (4 codewords x 4 bytes).
pub const ECC_BYTES: usize = 16;
/// Offset of the stored ECC codewords within the spare area.
pub const SPARE_ECC_OFFSET: usize = 0x30;

// ── ISFS layout ─────────────────────────────────────────────────────────────

/// Clusters occupied by one superblock candidate.
pub const SUPER_CLUSTERS: u16 = 0x10;
/// Bytes per superblock (16 clusters).
pub const SUPER_SIZE: usize = SUPER_CLUSTERS as usize * CLUSTER_SIZE;
/// Superblock magic, key-set version 0 (Wii keys).
pub const SUPER_MAGIC_V0: [u8; 4] = *b"SFFS";
/// Superblock magic, key-set version 1 (Wii U keys).
pub const SUPER_MAGIC_V1: [u8; 4] = *b"SFS!";
/// Superblock header bytes (magic + generation + reserved word).
pub const SUPER_HDR_SIZE: usize = 0xC;
/// Byte offset of the FAT within a superblock.
pub const SUPER_FAT_OFFSET: usize = SUPER_HDR_SIZE;
/// Byte offset of the FST within a superblock.
pub const SUPER_FST_OFFSET: usize = SUPER_FAT_OFFSET + 2 * CLUSTER_COUNT as usize;
/// Number of FST records in a superblock.
pub const FST_ENTRY_COUNT: usize = 6143;
/// Bytes per FST record.
pub const FST_ENTRY_SIZE: usize = 0x20;

/// HMAC digest length (HMAC-SHA1).
pub const HMAC_LEN: usize = 20;
/// Size of the HMAC seed block prepended to cluster data.
pub const HMAC_SEED_SIZE: usize = 0x40;
/// Offset of the starting-cluster field inside the metadata HMAC seed.
pub const HMAC_SEED_CLUSTER_OFFSET: usize = 0x12;

// ── ISFShax layout ──────────────────────────────────────────────────────────

/// "HAXX" marker of the embedded redundancy info block.
pub const ISFSHAX_MAGIC: u32 = 0x4841_5858;
/// Number of dedicated redundancy slots.
pub const ISFSHAX_REDUNDANCY: usize = 4;
/// First generation of the reserved high range; normal superblocks stay below.
pub const ISFSHAX_GENERATION_FIRST: u32 = 0xffff_7fff;
/// Width of the reserved generation range.
pub const ISFSHAX_GENERATION_RANGE: u32 = 0x100;
/// Byte offset of the info block within a superblock (packed at the tail).
pub const ISFSHAX_INFO_OFFSET: usize =
    SUPER_FST_OFFSET + FST_ENTRY_COUNT * FST_ENTRY_SIZE;
/// Size of the embedded info block.
pub const ISFSHAX_INFO_SIZE: usize = 0x14;

// ── Ancast container ────────────────────────────────────────────────────────

/// Ancast container magic at byte 0.
pub const ANCAST_MAGIC: u32 = 0xEFA2_82D9;
/// Byte offset of the signature-block offset field.
pub const ANCAST_SIG_OFFSET_FIELD: usize = 0x08;
/// Header offset for signature type 0x01.
pub const ANCAST_HEADER_OFFSET_SIG1: usize = 0xA0;
/// Header offset for signature type 0x02.
pub const ANCAST_HEADER_OFFSET_SIG2: usize = 0x1A0;
/// Size of the ancast image header including its tail padding; the body
/// starts at `header_offset + ANCAST_HEADER_SIZE` (0x100 or 0x200).
pub const ANCAST_HEADER_SIZE: usize = 0x60;

/// `device` target nibble: PowerPC image.
pub const ANCAST_TARGET_PPC: u8 = 0x01;
/// `device` target nibble: IOP (ARM) image.
pub const ANCAST_TARGET_IOP: u8 = 0x02;
/// PPC console type: Wii U mode.
pub const ANCAST_PPC_WIIU: u32 = 0x01;
/// PPC console type: vWii mode.
pub const ANCAST_PPC_VWII: u32 = 0x03;

/// Marker overwritten by the patch loader inside the first 4 KiB of an entry.
pub const ANCAST_MAGIC_JUMPOUT: u32 = 0xFFFF_0000;
/// Patch blob magic ("SALTPTCH").
pub const SALTPTCH_MAGIC: [u8; 8] = *b"SALTPTCH";
/// Only patch blob version understood by the loader.
pub const SALTPTCH_VERSION: u32 = 1;

/// ELF magic of a code plugin.
pub const PLUGIN_MAGIC_ELF: u32 = 0x7F45_4C46;
/// "DATA" magic of a data-carrying pseudo-plugin.
pub const PLUGIN_MAGIC_DATA: u32 = 0x4441_5441;
/// "PLUG" sentinel terminating the plugin chain.
pub const PLUGIN_MAGIC_PLUG: u32 = 0x504C_5547;
/// Byte offset of the chain-pointer slot relative to a plugin's entry.
pub const PLUGIN_CHAIN_OFFSET: usize = 0x10;
/// Upper bound on chained plugins.
pub const MAX_PLUGINS: usize = 256;

// ── Typed indices ───────────────────────────────────────────────────────────

/// NAND page index within a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageIndex(pub u32);

/// Filesystem cluster index within a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterIndex(pub u16);

impl ClusterIndex {
    /// First NAND page of this cluster.
    #[must_use]
    pub fn first_page(self) -> PageIndex {
        PageIndex(u32::from(self.0) * CLUSTER_PAGES)
    }

    /// First SD sector of this cluster on a redNAND partition (relative LBA).
    #[must_use]
    pub fn first_sector(self) -> SectorIndex {
        SectorIndex(u32::from(self.0) * SECTORS_PER_CLUSTER)
    }

    /// Next cluster index, `None` at the end of the bank.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        let n = self.0.checked_add(1)?;
        (n < CLUSTER_COUNT).then_some(Self(n))
    }
}

/// 512-byte sector index on an SD-backed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorIndex(pub u32);

impl SectorIndex {
    /// Add a sector count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, sectors: u32) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }
}

/// Superblock candidate slot (0..super_count within the reserved tail region).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SuperSlot(pub u8);

/// Index into the FST record array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FstIndex(pub u16);

impl FstIndex {
    /// Raw value meaning "no entry" in sub/sib links.
    pub const NONE_RAW: u16 = 0xFFFF;

    /// Decode a sub/sib link field.
    #[must_use]
    pub fn from_link(raw: u16) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(Self(raw))
    }

    /// Encode for a sub/sib link field.
    #[must_use]
    pub fn to_link(this: Option<Self>) -> u16 {
        this.map_or(Self::NONE_RAW, |idx| idx.0)
    }
}

/// Superblock generation counter.
///
/// Selection is over a half-open `[min, max)` window per volume, never a
/// plain "greater than" against a single previous value, so the reserved
/// high range can coexist with normal generations on the same flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u32);

impl Generation {
    /// Successor generation, `None` if the counter would wrap.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// True for generations inside the reserved redundancy range.
    #[must_use]
    pub fn is_reserved_range(self) -> bool {
        self.0 >= ISFSHAX_GENERATION_FIRST
    }
}

// ── FAT entries ─────────────────────────────────────────────────────────────

/// Decoded FAT cell: either the next cluster of a chain or a sentinel.
///
/// `Invalid` preserves raw cells that name a cluster beyond the bank (seen
/// on malformed dumps); they round-trip unchanged and never allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatEntry {
    /// Chain continues at the given cluster.
    Chain(ClusterIndex),
    /// Last cluster of a chain.
    Last,
    /// Reserved cluster (superblock area and other pinned ranges).
    Reserved,
    /// Factory or runtime bad block.
    Bad,
    /// Free space.
    Empty,
    /// Out-of-range raw value, kept for round-tripping.
    Invalid(u16),
}

impl FatEntry {
    pub const RAW_LAST: u16 = 0xFFFB;
    pub const RAW_RESERVED: u16 = 0xFFFC;
    pub const RAW_BAD: u16 = 0xFFFD;
    pub const RAW_EMPTY: u16 = 0xFFFE;

    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            Self::RAW_LAST => Self::Last,
            Self::RAW_RESERVED => Self::Reserved,
            Self::RAW_BAD => Self::Bad,
            Self::RAW_EMPTY => Self::Empty,
            n if n < CLUSTER_COUNT => Self::Chain(ClusterIndex(n)),
            n => Self::Invalid(n),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Chain(idx) => idx.0,
            Self::Last => Self::RAW_LAST,
            Self::Reserved => Self::RAW_RESERVED,
            Self::Bad => Self::RAW_BAD,
            Self::Empty => Self::RAW_EMPTY,
            Self::Invalid(raw) => raw,
        }
    }

    /// True if the cell may be handed out by the allocator.
    #[must_use]
    pub fn is_free(self) -> bool {
        matches!(self, Self::Empty)
    }
}

// ── Memory regions ──────────────────────────────────────────────────────────

/// A named physical memory window of the boot environment.
///
/// The library never dereferences these addresses; loaders model each region
/// as an owned buffer and use the region for bounds/offset arithmetic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegion {
    pub base: u32,
    pub len: u32,
}

impl MemRegion {
    #[must_use]
    pub const fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }

    /// One past the last contained address, `None` if the region wraps.
    #[must_use]
    pub fn end(self) -> Option<u32> {
        self.base.checked_add(self.len)
    }

    /// True if `[addr, addr+len)` lies fully inside the region.
    #[must_use]
    pub fn contains(self, addr: u32, len: u32) -> bool {
        let Some(region_end) = self.end() else {
            return false;
        };
        let Some(span_end) = addr.checked_add(len) else {
            return false;
        };
        addr >= self.base && span_end <= region_end
    }

    /// Byte offset of `addr` from the region base, if contained.
    #[must_use]
    pub fn offset_of(self, addr: u32) -> Option<usize> {
        if !self.contains(addr, 0) || addr == self.end()? {
            return None;
        }
        Some((addr - self.base) as usize)
    }
}

/// IOP (ARM) firmware load window.
pub const REGION_IOP: MemRegion = MemRegion::new(0x0100_0000, 0x0100_0000);
/// PPC load window, Wii U mode.
pub const REGION_PPC_WIIU: MemRegion = MemRegion::new(0x0800_0000, 0x0400_0000);
/// PPC load window, vWii mode.
pub const REGION_PPC_VWII: MemRegion = MemRegion::new(0x0133_0000, 0x00CD_0000);
/// Scratch buffer the patch stub is staged into.
pub const REGION_SCRATCH: MemRegion = MemRegion::new(0x0080_0000, 0x0080_0000);
/// Read-only superblock copy left in place by the previous boot stage.
pub const REGION_BOOT1_SUPER: MemRegion = MemRegion::new(0x01F8_0000, SUPER_SIZE as u32);
/// PRSH handoff region.
pub const REGION_PRSH: MemRegion = MemRegion::new(0x1000_0400, 0x7C00);
/// Fixed address of the PRSH header inside [`REGION_PRSH`].
pub const PRSH_HEADER_ADDR: u32 = 0x1000_5A54;
/// Fixed address and size of the bootstrap boot_info record.
pub const BOOT_INFO_ADDR: u32 = 0x1000_8000;
pub const BOOT_INFO_SIZE: u32 = 0x58;
/// Exclusive upper bound for plugin placement; the "PLUG" sentinel sits 8
/// bytes below it.
pub const RAMDISK_END_ADDR: u32 = 0x2800_0000;
/// Carveout directly below the ramdisk top where plugin blobs are laid.
pub const REGION_CARVEOUT: MemRegion =
    MemRegion::new(RAMDISK_END_ADDR - 0x0040_0000, 0x0040_0000);

// ── Parse errors and helpers ────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a fixed-width NUL-padded name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Encode a name into a fixed-width NUL-padded field.
///
/// Fails when the name (without terminator) does not fit.
pub fn encode_nul_padded<const N: usize>(name: &str) -> Result<[u8; N], ParseError> {
    let bytes = name.as_bytes();
    if bytes.len() > N {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "longer than field width",
        });
    }
    let mut out = [0_u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SuperSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FstIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
