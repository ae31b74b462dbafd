//! Embedded isfshax redundancy info block.
//!
//! Packed into the 0x14 bytes at the very tail of a superblock, after the
//! last FST record. Present only in superblocks written with a generation
//! inside the reserved high range.

use mnt_types::{
    ensure_slice, ensure_slice_mut, read_be_u32, write_be_u32, Generation, ParseError, SuperSlot,
    ISFSHAX_MAGIC, ISFSHAX_REDUNDANCY,
};
use serde::{Deserialize, Serialize};

/// Per-slot health byte: bad flag (bit 7), correctable-wear flag (bit 6),
/// 6-bit superblock slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsfshaxSlot {
    pub bad: bool,
    pub ecc_correctable: bool,
    pub slot: u8,
}

impl IsfshaxSlot {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        Self {
            bad: raw & 0x80 != 0,
            ecc_correctable: raw & 0x40 != 0,
            slot: raw & 0x3F,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        let mut raw = self.slot & 0x3F;
        if self.bad {
            raw |= 0x80;
        }
        if self.ecc_correctable {
            raw |= 0x40;
        }
        raw
    }

    #[must_use]
    pub fn super_slot(self) -> SuperSlot {
        SuperSlot(self.slot)
    }
}

/// The info block: magic, 4 slot bytes, generation bookkeeping, current
/// slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsfshaxInfo {
    pub slots: [IsfshaxSlot; ISFSHAX_REDUNDANCY],
    pub generation: Generation,
    pub generation_base: Generation,
    /// Index into `slots` of the copy this block was read from.
    pub index: u32,
}

impl IsfshaxInfo {
    /// Parse from a slice starting at the info block.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(data, 0x0)?;
        if magic != ISFSHAX_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(ISFSHAX_MAGIC),
                actual: u64::from(magic),
            });
        }

        let raw_slots = ensure_slice(data, 0x4, ISFSHAX_REDUNDANCY)?;
        let mut slots = [IsfshaxSlot::from_raw(0); ISFSHAX_REDUNDANCY];
        for (slot, raw) in slots.iter_mut().zip(raw_slots) {
            *slot = IsfshaxSlot::from_raw(*raw);
        }

        Ok(Self {
            slots,
            generation: Generation(read_be_u32(data, 0x8)?),
            generation_base: Generation(read_be_u32(data, 0xC)?),
            index: read_be_u32(data, 0x10)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(data, 0x0, ISFSHAX_MAGIC)?;
        let raw_slots = ensure_slice_mut(data, 0x4, ISFSHAX_REDUNDANCY)?;
        for (raw, slot) in raw_slots.iter_mut().zip(self.slots) {
            *raw = slot.to_raw();
        }
        write_be_u32(data, 0x8, self.generation.0)?;
        write_be_u32(data, 0xC, self.generation_base.0)?;
        write_be_u32(data, 0x10, self.index)?;
        Ok(())
    }

    /// The slot entry this block claims to live in, `None` when the index
    /// field is out of range.
    #[must_use]
    pub fn current(&self) -> Option<IsfshaxSlot> {
        self.slots.get(self.index as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnt_types::{ISFSHAX_GENERATION_FIRST, ISFSHAX_INFO_SIZE};

    fn sample_info() -> IsfshaxInfo {
        IsfshaxInfo {
            slots: [
                IsfshaxSlot { bad: false, ecc_correctable: false, slot: 60 },
                IsfshaxSlot { bad: false, ecc_correctable: false, slot: 61 },
                IsfshaxSlot { bad: true, ecc_correctable: false, slot: 62 },
                IsfshaxSlot { bad: false, ecc_correctable: true, slot: 63 },
            ],
            generation: Generation(ISFSHAX_GENERATION_FIRST + 5),
            generation_base: Generation(ISFSHAX_GENERATION_FIRST),
            index: 1,
        }
    }

    #[test]
    fn slot_byte_packing() {
        let slot = IsfshaxSlot { bad: true, ecc_correctable: false, slot: 0x3D };
        assert_eq!(slot.to_raw(), 0xBD);
        assert_eq!(IsfshaxSlot::from_raw(0xBD), slot);

        let slot = IsfshaxSlot { bad: false, ecc_correctable: true, slot: 1 };
        assert_eq!(slot.to_raw(), 0x41);
        assert_eq!(IsfshaxSlot::from_raw(0x41), slot);

        // Overlong slot numbers are masked to 6 bits.
        let slot = IsfshaxSlot { bad: false, ecc_correctable: false, slot: 0xFF };
        assert_eq!(slot.to_raw(), 0x3F);
    }

    #[test]
    fn info_round_trip() {
        assert_eq!(4 + ISFSHAX_REDUNDANCY + 4 + 4 + 4, ISFSHAX_INFO_SIZE);

        let info = sample_info();
        let mut block = [0_u8; ISFSHAX_INFO_SIZE];
        info.write_to(&mut block).expect("serialize");

        assert_eq!(block[..4], *b"HAXX");
        let parsed = IsfshaxInfo::parse(&block).expect("parse");
        assert_eq!(parsed, info);
        assert_eq!(parsed.current().expect("current slot").slot, 61);
    }

    #[test]
    fn rejects_missing_magic() {
        let block = [0_u8; ISFSHAX_INFO_SIZE];
        assert!(matches!(
            IsfshaxInfo::parse(&block),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn out_of_range_index_has_no_current() {
        let mut info = sample_info();
        info.index = 4;
        assert!(info.current().is_none());
    }
}
