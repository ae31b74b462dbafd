//! PRSH handoff table layout.
//!
//! The table lives in a reserved RAM window carried across boot stages:
//! a header (checksum, "PRSH" magic, version, size, boot1 flag, capacity,
//! used count), `total_entries` fixed-width records, and a "PRST" trailer
//! with its own checksum. Records name a data region by address and size;
//! the table itself never contains the data.
//!
//! The header checksum XORs one word per `entries * 0x12C` bytes but starts
//! the span at the magic word, exactly as the firmware computes it. Keep it
//! that way or inherited tables stop validating.

use mnt_types::{
    encode_nul_padded, ensure_slice, ensure_slice_mut, read_be_u32, trim_nul_padded, write_be_u32,
    ParseError,
};
use serde::{Deserialize, Serialize};

/// "PRSH" header magic.
pub const PRSH_MAGIC: u32 = 0x5052_5348;
/// "PRST" trailer magic.
pub const PRST_MAGIC: u32 = 0x5052_5354;

/// Header bytes before the record array.
pub const PRSH_HEADER_SIZE: usize = 0x1C;
/// Bytes per record.
pub const PRSH_RECORD_SIZE: usize = 0x12C;
/// Width of a record's name field.
pub const PRSH_NAME_LEN: usize = 0x100;
/// Trailer bytes after the record array.
pub const PRST_SIZE: usize = 0x10;

/// Record capacity written when the table is recreated from scratch.
pub const PRSH_DEFAULT_CAPACITY: u32 = 0x20;
/// `total_entries` above this means the table is corrupt; checked before
/// any record traversal.
pub const PRSH_MAX_TOTAL_ENTRIES: u32 = 0x100;
/// `is_set` value of a populated record.
pub const PRSH_IS_SET: u32 = 0x8000_0000;

// Record field offsets.
const REC_DATA: usize = 0x100;
const REC_SIZE: usize = 0x104;
const REC_IS_SET: usize = 0x108;

/// Parsed PRSH header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrshHeader {
    pub checksum: u32,
    pub version: u32,
    /// Header-plus-record-array size as the firmware accounts it.
    pub size: u32,
    pub is_boot1: u32,
    /// Record capacity.
    pub total_entries: u32,
    /// Records in use.
    pub entries: u32,
}

impl PrshHeader {
    /// Parse from a slice starting at the header (the checksum word).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(data, 0x4)?;
        if magic != PRSH_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(PRSH_MAGIC),
                actual: u64::from(magic),
            });
        }

        Ok(Self {
            checksum: read_be_u32(data, 0x00)?,
            version: read_be_u32(data, 0x08)?,
            size: read_be_u32(data, 0x0C)?,
            is_boot1: read_be_u32(data, 0x10)?,
            total_entries: read_be_u32(data, 0x14)?,
            entries: read_be_u32(data, 0x18)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(data, 0x00, self.checksum)?;
        write_be_u32(data, 0x04, PRSH_MAGIC)?;
        write_be_u32(data, 0x08, self.version)?;
        write_be_u32(data, 0x0C, self.size)?;
        write_be_u32(data, 0x10, self.is_boot1)?;
        write_be_u32(data, 0x14, self.total_entries)?;
        write_be_u32(data, 0x18, self.entries)?;
        Ok(())
    }

    /// True when the capacity field is past the corruption bound.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.total_entries > PRSH_MAX_TOTAL_ENTRIES
    }
}

/// One record: a name and the region it points at.
///
/// The 0x20 reserved bytes at the record tail are left untouched by all
/// mutations, so parse only carries the live fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrshRecord {
    pub name: String,
    pub data_addr: u32,
    pub size: u32,
    pub is_set: u32,
}

impl PrshRecord {
    /// Parse from a slice starting at the record.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let name = trim_nul_padded(ensure_slice(data, 0, PRSH_NAME_LEN)?);
        Ok(Self {
            name,
            data_addr: read_be_u32(data, REC_DATA)?,
            size: read_be_u32(data, REC_SIZE)?,
            is_set: read_be_u32(data, REC_IS_SET)?,
        })
    }

    /// Serialize the live fields; reserved tail bytes are not written.
    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        let name = encode_nul_padded::<PRSH_NAME_LEN>(&self.name)?;
        ensure_slice_mut(data, 0, PRSH_NAME_LEN)?.copy_from_slice(&name);
        write_be_u32(data, REC_DATA, self.data_addr)?;
        write_be_u32(data, REC_SIZE, self.size)?;
        write_be_u32(data, REC_IS_SET, self.is_set)?;
        Ok(())
    }

    /// Update only the pointer fields, preserving name and reserved bytes.
    pub fn write_fields_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(data, REC_DATA, self.data_addr)?;
        write_be_u32(data, REC_SIZE, self.size)?;
        write_be_u32(data, REC_IS_SET, self.is_set)?;
        Ok(())
    }

    /// Fixed-width name compare (the record name is a C string padded to
    /// the field width).
    #[must_use]
    pub fn name_matches(&self, name: &str) -> bool {
        self.name == name
    }
}

/// "PRST" trailer directly after the record array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrstTrailer {
    pub checksum: u32,
    pub size: u32,
    pub is_set: u32,
}

impl PrstTrailer {
    /// Parse from a slice starting at the trailer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(data, 0xC)?;
        if magic != PRST_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(PRST_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            checksum: read_be_u32(data, 0x0)?,
            size: read_be_u32(data, 0x4)?,
            is_set: read_be_u32(data, 0x8)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(data, 0x0, self.checksum)?;
        write_be_u32(data, 0x4, self.size)?;
        write_be_u32(data, 0x8, self.is_set)?;
        write_be_u32(data, 0xC, PRST_MAGIC)?;
        Ok(())
    }

    /// XOR of the three words after the checksum field.
    #[must_use]
    pub fn expected_checksum(&self) -> u32 {
        self.size ^ self.is_set ^ PRST_MAGIC
    }
}

/// Header checksum over the span the firmware covers: word-XOR starting at
/// the magic word, one word per `entries * PRSH_RECORD_SIZE` bytes.
///
/// `data` starts at the header.
pub fn header_checksum(data: &[u8], entries: u32) -> Result<u32, ParseError> {
    let record_bytes = (entries as usize)
        .checked_mul(PRSH_RECORD_SIZE)
        .ok_or(ParseError::IntegerConversion { field: "entries" })?;
    let span = ensure_slice(data, 0x4, record_bytes)?;

    let mut checksum = 0_u32;
    for word in span.chunks_exact(4) {
        checksum ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    }
    Ok(checksum)
}

// ── boot_info bootstrap record ──────────────────────────────────────────────

/// The 0x58-byte boot_info block the table is seeded with on recreate.
///
/// The four leading words are the live handoff state; the middle words are
/// reserved as found in shipped tables; the tail carries per-stage timing
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootInfo {
    pub is_coldboot: u32,
    pub boot_flags: u32,
    pub boot_state: u32,
    pub boot_count: u32,
    pub reserved: [u32; 10],
    pub boot1_main: u32,
    pub boot1_read: u32,
    pub boot1_verify: u32,
    pub boot1_decrypt: u32,
    pub boot0_main: u32,
    pub boot0_read: u32,
    pub boot0_verify: u32,
    pub boot0_decrypt: u32,
}

impl BootInfo {
    pub const SIZE: usize = 0x58;

    /// The block written on a fresh coldboot recreate, including the stand-in
    /// timing values.
    #[must_use]
    pub fn coldboot() -> Self {
        Self {
            is_coldboot: 1,
            boot_flags: 0x0400_0080,
            boot_state: 0,
            boot_count: 1,
            reserved: [
                0, 0, 0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF,
                0xFFFF_FFFF, 0, 0,
            ],
            boot1_main: 0x0036_9F6B,
            boot1_read: 0x0029_7268,
            boot1_verify: 0x0005_FCFE,
            boot1_decrypt: 0x0005_3CE8,
            boot0_main: 0x0001_2030,
            boot0_read: 0x0000_29D2,
            boot0_verify: 0x0000_D281,
            boot0_decrypt: 0x0000_027A,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut reserved = [0_u32; 10];
        for (i, word) in reserved.iter_mut().enumerate() {
            *word = read_be_u32(data, 0x10 + 4 * i)?;
        }

        Ok(Self {
            is_coldboot: read_be_u32(data, 0x00)?,
            boot_flags: read_be_u32(data, 0x04)?,
            boot_state: read_be_u32(data, 0x08)?,
            boot_count: read_be_u32(data, 0x0C)?,
            reserved,
            boot1_main: read_be_u32(data, 0x38)?,
            boot1_read: read_be_u32(data, 0x3C)?,
            boot1_verify: read_be_u32(data, 0x40)?,
            boot1_decrypt: read_be_u32(data, 0x44)?,
            boot0_main: read_be_u32(data, 0x48)?,
            boot0_read: read_be_u32(data, 0x4C)?,
            boot0_verify: read_be_u32(data, 0x50)?,
            boot0_decrypt: read_be_u32(data, 0x54)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(data, 0x00, self.is_coldboot)?;
        write_be_u32(data, 0x04, self.boot_flags)?;
        write_be_u32(data, 0x08, self.boot_state)?;
        write_be_u32(data, 0x0C, self.boot_count)?;
        for (i, word) in self.reserved.iter().enumerate() {
            write_be_u32(data, 0x10 + 4 * i, *word)?;
        }
        write_be_u32(data, 0x38, self.boot1_main)?;
        write_be_u32(data, 0x3C, self.boot1_read)?;
        write_be_u32(data, 0x40, self.boot1_verify)?;
        write_be_u32(data, 0x44, self.boot1_decrypt)?;
        write_be_u32(data, 0x48, self.boot0_main)?;
        write_be_u32(data, 0x4C, self.boot0_read)?;
        write_be_u32(data, 0x50, self.boot0_verify)?;
        write_be_u32(data, 0x54, self.boot0_decrypt)?;
        Ok(())
    }
}
