//! In-memory devices for tests and image assembly.
//!
//! [`MemNand`] stores pages sparsely: a page with no record reads back as
//! all-0xFF, which is exactly the erased state, so a full-geometry bank
//! costs only as much memory as the pages actually programmed. Programming
//! clears bits (old AND new), the way real flash behaves when a block is
//! reprogrammed without an erase.
//!
//! Both device types take fault plans: a counted number of failures for a
//! given page or first-sector, consumed as the faults fire. Bit corruption
//! helpers flip stored bits directly so ECC paths can be exercised.

use std::collections::HashMap;

use mnt_error::{MinuteError, Result};
use mnt_types::{PageIndex, SectorIndex, BLOCK_PAGES, PAGE_SIZE, PAGE_SPARE_SIZE, SECTOR_SIZE};
use parking_lot::Mutex;

use crate::device::{
    check_page, check_page_bufs, check_sector_span, NandBank, NandDevice, SectorDevice,
};

struct PageRecord {
    data: [u8; PAGE_SIZE],
    spare: [u8; PAGE_SPARE_SIZE],
}

impl PageRecord {
    fn erased() -> Self {
        Self {
            data: [0xFF; PAGE_SIZE],
            spare: [0xFF; PAGE_SPARE_SIZE],
        }
    }
}

#[derive(Default)]
struct FaultPlan {
    read: HashMap<u32, u32>,
    program: HashMap<u32, u32>,
    erase: HashMap<u32, u32>,
}

/// Consume one pending fault for `key`, if any.
fn take_fault(table: &mut HashMap<u32, u32>, key: u32) -> bool {
    match table.get_mut(&key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            if *remaining == 0 {
                table.remove(&key);
            }
            true
        }
        _ => false,
    }
}

struct MemState {
    pages: HashMap<u32, PageRecord>,
    faults: FaultPlan,
}

/// Sparse in-memory SLC bank.
pub struct MemNand {
    bank: NandBank,
    page_count: u32,
    state: Mutex<MemState>,
}

impl MemNand {
    /// Full-geometry erased bank.
    #[must_use]
    pub fn new(bank: NandBank) -> Self {
        Self::with_page_count(bank, mnt_types::NAND_PAGE_COUNT)
    }

    /// Erased bank with a reduced page count, for tests that only need a
    /// few blocks.
    #[must_use]
    pub fn with_page_count(bank: NandBank, page_count: u32) -> Self {
        Self {
            bank,
            page_count,
            state: Mutex::new(MemState {
                pages: HashMap::new(),
                faults: FaultPlan::default(),
            }),
        }
    }

    /// Fail the next `count` reads of `page`.
    pub fn fail_reads(&self, page: PageIndex, count: u32) {
        self.state.lock().faults.read.insert(page.0, count);
    }

    /// Fail the next `count` programs of `page`.
    pub fn fail_programs(&self, page: PageIndex, count: u32) {
        self.state.lock().faults.program.insert(page.0, count);
    }

    /// Fail the next `count` erases addressed through `page`.
    ///
    /// Keyed by the page the caller passes, not the block base.
    pub fn fail_erases(&self, page: PageIndex, count: u32) {
        self.state.lock().faults.erase.insert(page.0, count);
    }

    /// Flip one stored data bit. Creates the (erased) record if missing.
    pub fn flip_data_bit(&self, page: PageIndex, byte: usize, bit: u8) {
        let mut state = self.state.lock();
        let rec = state
            .pages
            .entry(page.0)
            .or_insert_with(PageRecord::erased);
        rec.data[byte] ^= 1 << bit;
    }

    /// Flip one stored spare bit. Creates the (erased) record if missing.
    pub fn flip_spare_bit(&self, page: PageIndex, byte: usize, bit: u8) {
        let mut state = self.state.lock();
        let rec = state
            .pages
            .entry(page.0)
            .or_insert_with(PageRecord::erased);
        rec.spare[byte] ^= 1 << bit;
    }

    /// Number of pages holding a programmed record.
    #[must_use]
    pub fn programmed_pages(&self) -> usize {
        self.state.lock().pages.len()
    }
}

impl NandDevice for MemNand {
    fn bank(&self) -> NandBank {
        self.bank
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, page: PageIndex, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        check_page_bufs(data.len(), spare.len())?;
        check_page(page, self.page_count)?;
        let mut state = self.state.lock();
        if take_fault(&mut state.faults.read, page.0) {
            return Err(MinuteError::Read { page });
        }
        match state.pages.get(&page.0) {
            Some(rec) => {
                data.copy_from_slice(&rec.data);
                spare.copy_from_slice(&rec.spare);
            }
            None => {
                data.fill(0xFF);
                spare.fill(0xFF);
            }
        }
        Ok(())
    }

    fn program_page(&self, page: PageIndex, data: &[u8], spare: &[u8]) -> Result<()> {
        check_page_bufs(data.len(), spare.len())?;
        check_page(page, self.page_count)?;
        let mut state = self.state.lock();
        if take_fault(&mut state.faults.program, page.0) {
            return Err(MinuteError::Write { page });
        }
        let rec = state
            .pages
            .entry(page.0)
            .or_insert_with(PageRecord::erased);
        for (dst, src) in rec.data.iter_mut().zip(data) {
            *dst &= *src;
        }
        for (dst, src) in rec.spare.iter_mut().zip(spare) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase_block(&self, page: PageIndex) -> Result<()> {
        check_page(page, self.page_count)?;
        let mut state = self.state.lock();
        if take_fault(&mut state.faults.erase, page.0) {
            return Err(MinuteError::Erase { page });
        }
        let first = page.0 - page.0 % BLOCK_PAGES;
        for p in first..first + BLOCK_PAGES {
            state.pages.remove(&p);
        }
        Ok(())
    }

    fn is_precorrected(&self) -> bool {
        false
    }
}

struct SectorState {
    sectors: HashMap<u32, [u8; SECTOR_SIZE]>,
    read_faults: HashMap<u32, u32>,
    write_faults: HashMap<u32, u32>,
}

/// In-memory sector store standing in for an SD card.
///
/// Sectors are stored sparsely and read back zero until written, so a
/// full-card geometry costs only what was actually touched.
pub struct MemSectorDevice {
    sector_count: u32,
    state: Mutex<SectorState>,
}

impl MemSectorDevice {
    /// Zero-reading store of `sector_count` sectors.
    #[must_use]
    pub fn new(sector_count: u32) -> Self {
        Self {
            sector_count,
            state: Mutex::new(SectorState {
                sectors: HashMap::new(),
                read_faults: HashMap::new(),
                write_faults: HashMap::new(),
            }),
        }
    }

    /// Fail the next `count` reads whose span starts at `first`.
    pub fn fail_reads(&self, first: SectorIndex, count: u32) {
        self.state.lock().read_faults.insert(first.0, count);
    }

    /// Fail the next `count` writes whose span starts at `first`.
    pub fn fail_writes(&self, first: SectorIndex, count: u32) {
        self.state.lock().write_faults.insert(first.0, count);
    }
}

impl SectorDevice for MemSectorDevice {
    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read_sectors(&self, first: SectorIndex, buf: &mut [u8]) -> Result<()> {
        check_sector_span(self.sector_count, first, buf.len())?;
        let mut state = self.state.lock();
        if take_fault(&mut state.read_faults, first.0) {
            return Err(MinuteError::Read {
                page: PageIndex(first.0),
            });
        }
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            match state.sectors.get(&(first.0 + i as u32)) {
                Some(sector) => chunk.copy_from_slice(sector),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_sectors(&self, first: SectorIndex, buf: &[u8]) -> Result<()> {
        check_sector_span(self.sector_count, first, buf.len())?;
        let mut state = self.state.lock();
        if take_fault(&mut state.write_faults, first.0) {
            return Err(MinuteError::Write {
                page: PageIndex(first.0),
            });
        }
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            let mut sector = [0_u8; SECTOR_SIZE];
            sector.copy_from_slice(chunk);
            state.sectors.insert(first.0 + i as u32, sector);
        }
        Ok(())
    }
}
