//! SD card master boot record.
//!
//! The only little-endian structure in the system. Partition discovery
//! ignores the boot signature (cards in the wild ship without it), so
//! parsing keeps it as data instead of validating it.

use mnt_types::{ensure_slice, ensure_slice_mut, read_le_u16, read_le_u32, ParseError};
use serde::{Deserialize, Serialize};

pub const MBR_SIZE: usize = 512;
pub const MBR_PART_COUNT: usize = 4;
pub const MBR_PART_TABLE_OFFSET: usize = 0x1BE;
pub const MBR_PART_ENTRY_SIZE: usize = 16;
pub const MBR_BOOT_SIG_OFFSET: usize = 0x1FE;
pub const MBR_BOOT_SIG: u16 = 0xAA55;

/// One 16-byte partition table entry. CHS fields are carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub bootable: u8,
    pub chs_start: [u8; 3],
    pub part_type: u8,
    pub chs_end: [u8; 3],
    pub lba_start: u32,
    pub lba_length: u32,
}

impl PartitionEntry {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, MBR_PART_ENTRY_SIZE)?;
        Ok(Self {
            bootable: raw[0],
            chs_start: [raw[1], raw[2], raw[3]],
            part_type: raw[4],
            chs_end: [raw[5], raw[6], raw[7]],
            lba_start: read_le_u32(raw, 8)?,
            lba_length: read_le_u32(raw, 12)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        let raw = ensure_slice_mut(data, 0, MBR_PART_ENTRY_SIZE)?;
        raw[0] = self.bootable;
        raw[1..4].copy_from_slice(&self.chs_start);
        raw[4] = self.part_type;
        raw[5..8].copy_from_slice(&self.chs_end);
        raw[8..12].copy_from_slice(&self.lba_start.to_le_bytes());
        raw[12..16].copy_from_slice(&self.lba_length.to_le_bytes());
        Ok(())
    }

    /// An all-zero table slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.part_type == 0
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bootable: 0,
            chs_start: [0; 3],
            part_type: 0,
            chs_end: [0; 3],
            lba_start: 0,
            lba_length: 0,
        }
    }
}

/// Parsed MBR sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mbr {
    pub partitions: [PartitionEntry; MBR_PART_COUNT],
    pub boot_signature: u16,
}

impl Mbr {
    /// Parse from a full 512-byte sector.
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        if sector.len() < MBR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: MBR_SIZE,
                offset: 0,
                actual: sector.len(),
            });
        }

        let mut partitions = [PartitionEntry::zeroed(); MBR_PART_COUNT];
        for (i, part) in partitions.iter_mut().enumerate() {
            let off = MBR_PART_TABLE_OFFSET + i * MBR_PART_ENTRY_SIZE;
            *part = PartitionEntry::parse(&sector[off..])?;
        }

        Ok(Self {
            partitions,
            boot_signature: read_le_u16(sector, MBR_BOOT_SIG_OFFSET)?,
        })
    }

    /// Serialize table and signature into a sector buffer; bootstrap code
    /// bytes are left alone.
    pub fn write_to(&self, sector: &mut [u8]) -> Result<(), ParseError> {
        for (i, part) in self.partitions.iter().enumerate() {
            let off = MBR_PART_TABLE_OFFSET + i * MBR_PART_ENTRY_SIZE;
            part.write_to(ensure_slice_mut(sector, off, MBR_PART_ENTRY_SIZE)?)?;
        }
        ensure_slice_mut(sector, MBR_BOOT_SIG_OFFSET, 2)?
            .copy_from_slice(&self.boot_signature.to_le_bytes());
        Ok(())
    }

    #[must_use]
    pub fn has_boot_signature(&self) -> bool {
        self.boot_signature == MBR_BOOT_SIG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_entry_is_little_endian() {
        let mut raw = [0_u8; MBR_PART_ENTRY_SIZE];
        raw[4] = 0x0D;
        raw[8..12].copy_from_slice(&[0x00, 0x02, 0x00, 0x00]); // 0x200
        raw[12..16].copy_from_slice(&[0x00, 0x00, 0xA2, 0x03]); // 0x3A20000

        let part = PartitionEntry::parse(&raw).expect("parse");
        assert_eq!(part.part_type, 0x0D);
        assert_eq!(part.lba_start, 0x200);
        assert_eq!(part.lba_length, 0x03A2_0000);

        let mut out = [0_u8; MBR_PART_ENTRY_SIZE];
        part.write_to(&mut out).expect("serialize");
        assert_eq!(out, raw);
    }

    #[test]
    fn mbr_round_trip() {
        let mut sector = [0_u8; MBR_SIZE];
        let mbr = Mbr {
            partitions: [
                PartitionEntry {
                    bootable: 0x80,
                    chs_start: [0, 1, 1],
                    part_type: 0x0C,
                    chs_end: [0xFE, 0xFF, 0xFF],
                    lba_start: 0x2000,
                    lba_length: 0x0010_0000,
                },
                PartitionEntry::zeroed(),
                PartitionEntry::zeroed(),
                PartitionEntry::zeroed(),
            ],
            boot_signature: MBR_BOOT_SIG,
        };
        mbr.write_to(&mut sector).expect("serialize");
        assert_eq!(sector[MBR_BOOT_SIG_OFFSET..], [0x55, 0xAA]);

        let parsed = Mbr::parse(&sector).expect("parse");
        assert_eq!(parsed, mbr);
        assert!(parsed.has_boot_signature());
        assert!(!parsed.partitions[0].is_empty());
        assert!(parsed.partitions[1].is_empty());
    }

    #[test]
    fn missing_signature_is_not_an_error() {
        let sector = [0_u8; MBR_SIZE];
        let parsed = Mbr::parse(&sector).expect("parse");
        assert!(!parsed.has_boot_signature());
        assert!(parsed.partitions.iter().all(PartitionEntry::is_empty));
    }

    #[test]
    fn short_sector_rejected() {
        assert!(matches!(
            Mbr::parse(&[0_u8; 511]),
            Err(ParseError::InsufficientData { .. })
        ));
    }
}
