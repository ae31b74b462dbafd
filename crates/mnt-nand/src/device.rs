//! Device traits for raw flash banks and 512-byte sector media.
//!
//! A [`NandDevice`] presents one SLC bank as raw pages: 2048 bytes of data
//! plus a 64-byte spare area, with erase granularity of one 64-page block.
//! The trait carries no ECC policy; [`crate::ecc`] layers that on top, and
//! [`program_page_ecc`] reproduces the controller's program path (spare
//! byte 0 forced to 0xFF, stored ECC recomputed from the data).
//!
//! A [`SectorDevice`] is flat 512-byte-sector storage, used for SD cards and
//! their image files. Sector transfer failures report through the same
//! `Read`/`Write` error families as pages, carrying the sector number.

use mnt_error::{MinuteError, Result};
use mnt_types::{
    PageIndex, SectorIndex, NAND_BANK_SLC, NAND_BANK_SLCCMPT, PAGE_SIZE, PAGE_SPARE_SIZE,
    SECTOR_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::ecc;

/// Which physical SLC bank a device presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NandBank {
    /// Wii-compat bank.
    Slccmpt,
    /// Wii U native bank.
    Slc,
}

impl NandBank {
    /// Raw bank selector used by the flash controller.
    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            Self::Slccmpt => NAND_BANK_SLCCMPT,
            Self::Slc => NAND_BANK_SLC,
        }
    }

    /// Volume name the bank is mounted under.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Slccmpt => "slccmpt",
            Self::Slc => "slc",
        }
    }
}

/// One raw SLC bank.
pub trait NandDevice: Send + Sync {
    /// Which bank this device presents.
    fn bank(&self) -> NandBank;

    /// Number of addressable pages.
    fn page_count(&self) -> u32;

    /// Read one raw page and its spare area, no ECC processing.
    ///
    /// `data` must be exactly [`PAGE_SIZE`] bytes and `spare` exactly
    /// [`PAGE_SPARE_SIZE`] bytes.
    fn read_page(&self, page: PageIndex, data: &mut [u8], spare: &mut [u8]) -> Result<()>;

    /// Program one page verbatim, data and spare exactly as given.
    ///
    /// The page is assumed erased; wear and bit-clearing semantics are the
    /// implementation's business.
    fn program_page(&self, page: PageIndex, data: &[u8], spare: &[u8]) -> Result<()>;

    /// Erase the whole 64-page block containing `page`.
    fn erase_block(&self, page: PageIndex) -> Result<()>;

    /// True when the backing store already went through ECC correction.
    ///
    /// Raw dumps are captured post-correction, so reads from them must not
    /// run the engine again; live banks and fresh in-memory models return
    /// false.
    fn is_precorrected(&self) -> bool;
}

/// Program a page through the controller's ECC path.
///
/// The caller's spare is carried except for byte 0, which is forced to 0xFF
/// (the factory bad-block marker position), and the stored ECC field, which
/// is recomputed from `data` no matter what the caller staged there.
pub fn program_page_ecc(
    dev: &dyn NandDevice,
    page: PageIndex,
    data: &[u8],
    spare: &[u8],
) -> Result<()> {
    check_page_bufs(data.len(), spare.len())?;
    let mut cooked = [0_u8; PAGE_SPARE_SIZE];
    cooked.copy_from_slice(spare);
    ecc::finalize_spare(data, &mut cooked);
    dev.program_page(page, data, &cooked)
}

/// Flat 512-byte-sector storage.
pub trait SectorDevice: Send + Sync {
    /// Number of addressable sectors.
    fn sector_count(&self) -> u32;

    /// Read `buf.len() / SECTOR_SIZE` sectors starting at `first`.
    ///
    /// `buf` must be a whole number of sectors.
    fn read_sectors(&self, first: SectorIndex, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / SECTOR_SIZE` sectors starting at `first`.
    fn write_sectors(&self, first: SectorIndex, buf: &[u8]) -> Result<()>;
}

/// Validate a page-sized data/spare buffer pair.
pub(crate) fn check_page_bufs(data_len: usize, spare_len: usize) -> Result<()> {
    if data_len != PAGE_SIZE {
        return Err(MinuteError::Format(format!(
            "page buffer is {data_len} bytes, need {PAGE_SIZE}"
        )));
    }
    if spare_len != PAGE_SPARE_SIZE {
        return Err(MinuteError::Format(format!(
            "spare buffer is {spare_len} bytes, need {PAGE_SPARE_SIZE}"
        )));
    }
    Ok(())
}

/// Validate a page index against the device size.
pub(crate) fn check_page(page: PageIndex, page_count: u32) -> Result<()> {
    if page.0 >= page_count {
        return Err(MinuteError::Format(format!(
            "page {page} out of range (bank has {page_count} pages)"
        )));
    }
    Ok(())
}

/// Validate a sector span and return its sector count.
pub(crate) fn check_sector_span(
    total: u32,
    first: SectorIndex,
    buf_len: usize,
) -> Result<u32> {
    if buf_len % SECTOR_SIZE != 0 {
        return Err(MinuteError::Format(format!(
            "sector buffer is {buf_len} bytes, not a whole number of sectors"
        )));
    }
    let count = u32::try_from(buf_len / SECTOR_SIZE).map_err(|_| {
        MinuteError::Format("sector buffer exceeds the addressable range".to_owned())
    })?;
    let end = first.checked_add(count).ok_or_else(|| {
        MinuteError::Format(format!("sector span {first}+{count} overflows"))
    })?;
    if end.0 > total {
        return Err(MinuteError::Format(format!(
            "sector span {first}+{count} out of range (device has {total} sectors)"
        )));
    }
    Ok(count)
}
