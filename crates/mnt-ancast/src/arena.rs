//! Owned stand-in for a fixed physical RAM window.
//!
//! The firmware writes images to hard addresses; on a host there is no RAM
//! at 0x01000000 to write to. An [`Arena`] owns a zeroed buffer the size of
//! one [`MemRegion`] and translates absolute addresses into offsets, so the
//! loaders keep the original address arithmetic while every access stays
//! bounds-checked.

use mnt_error::{MinuteError, Result};
use mnt_types::MemRegion;

/// One RAM window, addressed by the absolute addresses of the region it
/// models.
pub struct Arena {
    region: MemRegion,
    bytes: Vec<u8>,
}

impl Arena {
    /// Zeroed window covering `region`.
    #[must_use]
    pub fn new(region: MemRegion) -> Self {
        Self {
            region,
            bytes: vec![0; region.len as usize],
        }
    }

    #[must_use]
    pub fn region(&self) -> MemRegion {
        self.region
    }

    /// Whole window, starting at the region base.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Translate an absolute span into a window offset.
    fn offset(&self, addr: u32, len: usize) -> Result<usize> {
        let span = u32::try_from(len)
            .ok()
            .filter(|span| self.region.contains(addr, *span));
        match (span, self.region.offset_of(addr)) {
            (Some(_), Some(offset)) => Ok(offset),
            _ => Err(MinuteError::Format(format!(
                "span {addr:#010x}+{len:#x} outside window {:#010x}+{:#x}",
                self.region.base, self.region.len
            ))),
        }
    }

    /// View `len` bytes at absolute address `addr`.
    pub fn slice(&self, addr: u32, len: usize) -> Result<&[u8]> {
        let offset = self.offset(addr, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8]> {
        let offset = self.offset(addr, len)?;
        Ok(&mut self.bytes[offset..offset + len])
    }

    /// Read the big-endian word at absolute address `addr`.
    pub fn read_word(&self, addr: u32) -> Result<u32> {
        let word = self.slice(addr, 4)?;
        Ok(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
    }

    /// Store a big-endian word at absolute address `addr`.
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<()> {
        self.slice_mut(addr, 4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_starts_zeroed_and_sized() {
        let arena = Arena::new(MemRegion::new(0x0100_0000, 0x40));
        assert_eq!(arena.bytes().len(), 0x40);
        assert!(arena.bytes().iter().all(|b| *b == 0));
        assert_eq!(arena.region().base, 0x0100_0000);
    }

    #[test]
    fn absolute_addressing_round_trips() {
        let mut arena = Arena::new(MemRegion::new(0x0100_0000, 0x100));
        arena.write_word(0x0100_0020, 0xDEAD_BEEF).expect("write");
        assert_eq!(arena.read_word(0x0100_0020).expect("read"), 0xDEAD_BEEF);
        // Big-endian in the window.
        assert_eq!(
            arena.slice(0x0100_0020, 4).expect("slice"),
            &[0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn out_of_window_spans_rejected() {
        let mut arena = Arena::new(MemRegion::new(0x0100_0000, 0x100));
        assert!(arena.slice(0x00FF_FFFC, 4).is_err());
        assert!(arena.slice(0x0100_00FE, 4).is_err());
        assert!(arena.read_word(0x0100_0100).is_err());
        assert!(arena.write_word(0x0200_0000, 1).is_err());
        // The last in-window word is fine.
        assert_eq!(arena.read_word(0x0100_00FC).expect("read"), 0);
    }

    #[test]
    fn slices_map_to_window_offsets() {
        let mut arena = Arena::new(MemRegion::new(0x0080_0000, 0x40));
        arena
            .slice_mut(0x0080_0010, 4)
            .expect("slice")
            .copy_from_slice(b"PLUG");
        assert_eq!(&arena.bytes()[0x10..0x14], b"PLUG");
        assert_eq!(arena.into_bytes().len(), 0x40);
    }
}
