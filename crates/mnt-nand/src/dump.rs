//! Raw bank dump, restore, and red-image seeding.
//!
//! A raw dump carries every page as a 2112-byte record, data then spare,
//! captured after ECC correction ran. Restore is the mirror image run
//! through the controller's program path: the whole bank is erased first,
//! all-0xFF records are skipped (programming them is a no-op on erased
//! flash), carried spare bytes keep their HMAC copies, the stored ECC is
//! recomputed, and every programmed page is read back to prove it stuck.
//!
//! Seeding copies a bank's corrected page data, without spare areas, into
//! sector storage, which is how a redirected SLC partition gets its first
//! contents.

use std::io::{Read, Write};

use mnt_error::{MinuteError, Result};
use mnt_types::{PageIndex, SectorIndex, BLOCK_PAGES, PAGE_SIZE, PAGE_SPARE_SIZE, SECTOR_SIZE};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::{program_page_ecc, NandDevice, SectorDevice};
use crate::ecc::{correct_page, EccStatus};

/// Pages buffered per seeding batch (one 256 KiB sector transfer).
pub const SEED_BATCH_PAGES: u32 = 128;

const PAGE_SECTORS: u32 = (PAGE_SIZE / SECTOR_SIZE) as u32;

/// Counters for a dump or seeding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStats {
    pub pages: u32,
    pub corrected: u32,
    pub uncorrectable: u32,
}

/// Counters for a restore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    pub pages_programmed: u32,
    pub pages_skipped: u32,
    pub readback_corrected: u32,
}

/// Dump every page of the bank as raw records.
///
/// Live banks get their data ECC-corrected on the way out; uncorrectable
/// pages are dumped as read and counted, the dump keeps going.
pub fn dump_raw<W: Write>(nand: &dyn NandDevice, out: &mut W) -> Result<DumpStats> {
    let mut stats = DumpStats::default();
    let mut data = [0_u8; PAGE_SIZE];
    let mut spare = [0_u8; PAGE_SPARE_SIZE];

    for page in 0..nand.page_count() {
        let idx = PageIndex(page);
        nand.read_page(idx, &mut data, &mut spare)?;
        if !nand.is_precorrected() {
            match correct_page(&mut data, &spare) {
                EccStatus::Uncorrectable => {
                    warn!(page, "uncorrectable page, dumped as read");
                    stats.uncorrectable += 1;
                }
                EccStatus::Corrected => stats.corrected += 1,
                EccStatus::Clean => {}
            }
        }
        out.write_all(&data)?;
        out.write_all(&spare)?;
        stats.pages += 1;
    }
    Ok(stats)
}

/// Restore a full-bank image onto the device.
///
/// `image_len` must match the bank exactly; the check runs before the
/// erase pass so a truncated image never costs the existing contents.
pub fn restore_raw<R: Read>(
    nand: &dyn NandDevice,
    image: &mut R,
    image_len: u64,
) -> Result<RestoreStats> {
    let record = (PAGE_SIZE + PAGE_SPARE_SIZE) as u64;
    let expected = u64::from(nand.page_count()) * record;
    if image_len != expected {
        return Err(MinuteError::Format(format!(
            "image is {image_len} bytes, a full bank is {expected}"
        )));
    }

    // Phase 1: erase the whole bank.
    let mut page = 0;
    while page < nand.page_count() {
        nand.erase_block(PageIndex(page))?;
        page += BLOCK_PAGES;
    }

    // Phase 2: program every non-blank record and read it back.
    let mut stats = RestoreStats::default();
    let mut data = [0_u8; PAGE_SIZE];
    let mut spare = [0_u8; PAGE_SPARE_SIZE];
    let mut rb_data = [0_u8; PAGE_SIZE];
    let mut rb_spare = [0_u8; PAGE_SPARE_SIZE];

    for page in 0..nand.page_count() {
        image.read_exact(&mut data)?;
        image.read_exact(&mut spare)?;
        if data.iter().all(|&b| b == 0xFF) && spare.iter().all(|&b| b == 0xFF) {
            stats.pages_skipped += 1;
            continue;
        }

        let idx = PageIndex(page);
        program_page_ecc(nand, idx, &data, &spare)?;

        nand.read_page(idx, &mut rb_data, &mut rb_spare)?;
        if nand.is_precorrected() {
            if rb_data != data {
                return Err(MinuteError::Readback { page: idx });
            }
        } else {
            match correct_page(&mut rb_data, &rb_spare) {
                EccStatus::Uncorrectable => {
                    return Err(MinuteError::Readback { page: idx });
                }
                EccStatus::Corrected => stats.readback_corrected += 1,
                EccStatus::Clean => {}
            }
        }
        stats.pages_programmed += 1;
    }
    Ok(stats)
}

/// Copy a bank's corrected page data into sector storage, spares dropped.
pub fn copy_nand_to_sectors(
    nand: &dyn NandDevice,
    dst: &dyn SectorDevice,
    dst_base: SectorIndex,
) -> Result<DumpStats> {
    let pages = nand.page_count();
    let sectors_needed = pages.checked_mul(PAGE_SECTORS).ok_or_else(|| {
        MinuteError::Format("bank size overflows the sector range".to_owned())
    })?;
    let end = dst_base.checked_add(sectors_needed).ok_or_else(|| {
        MinuteError::Format("destination span overflows the sector range".to_owned())
    })?;
    if end.0 > dst.sector_count() {
        return Err(MinuteError::Format(format!(
            "bank needs {sectors_needed} sectors at {dst_base}, device has {}",
            dst.sector_count()
        )));
    }

    let mut stats = DumpStats::default();
    let mut data = [0_u8; PAGE_SIZE];
    let mut spare = [0_u8; PAGE_SPARE_SIZE];
    let mut batch = vec![0_u8; SEED_BATCH_PAGES as usize * PAGE_SIZE];

    let mut page = 0;
    while page < pages {
        let span = SEED_BATCH_PAGES.min(pages - page);
        for k in 0..span {
            let idx = PageIndex(page + k);
            nand.read_page(idx, &mut data, &mut spare)?;
            if !nand.is_precorrected() {
                match correct_page(&mut data, &spare) {
                    EccStatus::Uncorrectable => {
                        warn!(page = idx.0, "uncorrectable page, seeded as read");
                        stats.uncorrectable += 1;
                    }
                    EccStatus::Corrected => stats.corrected += 1,
                    EccStatus::Clean => {}
                }
            }
            let at = k as usize * PAGE_SIZE;
            batch[at..at + PAGE_SIZE].copy_from_slice(&data);
            stats.pages += 1;
        }
        let first = SectorIndex(dst_base.0 + page * PAGE_SECTORS);
        dst.write_sectors(first, &batch[..span as usize * PAGE_SIZE])?;
        page += span;
    }
    Ok(stats)
}
