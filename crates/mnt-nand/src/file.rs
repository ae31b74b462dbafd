//! File-backed devices: raw NAND dump images and SD card images.
//!
//! Uses `std::os::unix::fs::FileExt` positioned I/O, which is thread-safe
//! and needs no shared seek position. Files are opened read-write when
//! possible and fall back to read-only; writes to a read-only device fail
//! without touching the file.
//!
//! A raw dump is a sequence of 2112-byte records, 2048 bytes of page data
//! followed by the 64-byte spare area. Dumps are captured after the ECC
//! engine ran, so [`FileNand`] reports itself pre-corrected and readers
//! must not run the engine again.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use mnt_error::{MinuteError, Result};
use mnt_types::{
    PageIndex, SectorIndex, BLOCK_PAGES, PAGE_SIZE, PAGE_SPARE_SIZE, SECTOR_SIZE,
};

use crate::device::{
    check_page, check_page_bufs, check_sector_span, NandBank, NandDevice, SectorDevice,
};

const RECORD_SIZE: u64 = (PAGE_SIZE + PAGE_SPARE_SIZE) as u64;

fn open_rw_or_ro(path: &Path) -> Result<(Arc<File>, bool)> {
    let (file, writable) = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map(|file| (file, true))
        .or_else(|_| {
            OpenOptions::new()
                .read(true)
                .open(path)
                .map(|file| (file, false))
        })?;
    Ok((Arc::new(file), writable))
}

/// Raw dump image presented as an SLC bank.
#[derive(Debug, Clone)]
pub struct FileNand {
    file: Arc<File>,
    bank: NandBank,
    page_count: u32,
    writable: bool,
}

impl FileNand {
    /// Open an existing dump. The file length must be a whole number of
    /// 2112-byte records; full-bank dumps carry
    /// [`mnt_types::NAND_PAGE_COUNT`] of them.
    pub fn open(path: impl AsRef<Path>, bank: NandBank) -> Result<Self> {
        let (file, writable) = open_rw_or_ro(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % RECORD_SIZE != 0 {
            return Err(MinuteError::Format(format!(
                "dump length {len} is not a whole number of {RECORD_SIZE}-byte records"
            )));
        }
        let page_count = u32::try_from(len / RECORD_SIZE).map_err(|_| {
            MinuteError::Format(format!("dump of {len} bytes exceeds the addressable range"))
        })?;
        Ok(Self {
            file,
            bank,
            page_count,
            writable,
        })
    }

    /// Create a fresh all-0xFF image of `page_count` pages.
    pub fn create(path: impl AsRef<Path>, bank: NandBank, page_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let blank = vec![0xFF_u8; BLOCK_PAGES as usize * RECORD_SIZE as usize];
        let mut page = 0;
        while page < page_count {
            let span = BLOCK_PAGES.min(page_count - page) as usize;
            file.write_all_at(
                &blank[..span * RECORD_SIZE as usize],
                u64::from(page) * RECORD_SIZE,
            )?;
            page += span as u32;
        }
        Ok(Self {
            file: Arc::new(file),
            bank,
            page_count,
            writable: true,
        })
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(MinuteError::Format(
                "dump image is opened read-only".to_owned(),
            ));
        }
        Ok(())
    }
}

impl NandDevice for FileNand {
    fn bank(&self) -> NandBank {
        self.bank
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, page: PageIndex, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        check_page_bufs(data.len(), spare.len())?;
        check_page(page, self.page_count)?;
        let base = u64::from(page.0) * RECORD_SIZE;
        self.file.read_exact_at(data, base)?;
        self.file.read_exact_at(spare, base + PAGE_SIZE as u64)?;
        Ok(())
    }

    fn program_page(&self, page: PageIndex, data: &[u8], spare: &[u8]) -> Result<()> {
        check_page_bufs(data.len(), spare.len())?;
        check_page(page, self.page_count)?;
        self.check_writable()?;
        let base = u64::from(page.0) * RECORD_SIZE;
        self.file.write_all_at(data, base)?;
        self.file.write_all_at(spare, base + PAGE_SIZE as u64)?;
        Ok(())
    }

    fn erase_block(&self, page: PageIndex) -> Result<()> {
        check_page(page, self.page_count)?;
        self.check_writable()?;
        let first = page.0 - page.0 % BLOCK_PAGES;
        let blank = vec![0xFF_u8; RECORD_SIZE as usize];
        for p in first..(first + BLOCK_PAGES).min(self.page_count) {
            self.file.write_all_at(&blank, u64::from(p) * RECORD_SIZE)?;
        }
        Ok(())
    }

    fn is_precorrected(&self) -> bool {
        true
    }
}

/// SD card image presented as sector storage.
#[derive(Debug, Clone)]
pub struct FileSectorDevice {
    file: Arc<File>,
    sector_count: u32,
    writable: bool,
}

impl FileSectorDevice {
    /// Open an existing image. The length must be a whole number of sectors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = open_rw_or_ro(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(MinuteError::Format(format!(
                "image length {len} is not a whole number of sectors"
            )));
        }
        let sector_count = u32::try_from(len / SECTOR_SIZE as u64).map_err(|_| {
            MinuteError::Format(format!("image of {len} bytes exceeds the addressable range"))
        })?;
        Ok(Self {
            file,
            sector_count,
            writable,
        })
    }

    /// Create a fresh zero-filled image of `sector_count` sectors.
    pub fn create(path: impl AsRef<Path>, sector_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(sector_count) * SECTOR_SIZE as u64)?;
        Ok(Self {
            file: Arc::new(file),
            sector_count,
            writable: true,
        })
    }
}

impl SectorDevice for FileSectorDevice {
    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read_sectors(&self, first: SectorIndex, buf: &mut [u8]) -> Result<()> {
        check_sector_span(self.sector_count, first, buf.len())?;
        self.file
            .read_exact_at(buf, u64::from(first.0) * SECTOR_SIZE as u64)?;
        Ok(())
    }

    fn write_sectors(&self, first: SectorIndex, buf: &[u8]) -> Result<()> {
        check_sector_span(self.sector_count, first, buf.len())?;
        if !self.writable {
            return Err(MinuteError::Format(
                "image is opened read-only".to_owned(),
            ));
        }
        self.file
            .write_all_at(buf, u64::from(first.0) * SECTOR_SIZE as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_records_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bank.bin");
        let nand = FileNand::create(&path, NandBank::Slc, 128).expect("create");
        assert_eq!(nand.page_count(), 128);
        assert!(nand.is_precorrected());

        let data = [0x3C_u8; PAGE_SIZE];
        let mut spare = [0_u8; PAGE_SPARE_SIZE];
        spare[1] = 0xEE;
        nand.program_page(PageIndex(5), &data, &spare).expect("program");

        let reopened = FileNand::open(&path, NandBank::Slc).expect("open");
        assert_eq!(reopened.page_count(), 128);
        let mut rd = [0_u8; PAGE_SIZE];
        let mut rs = [0_u8; PAGE_SPARE_SIZE];
        reopened
            .read_page(PageIndex(5), &mut rd, &mut rs)
            .expect("read");
        assert_eq!(rd, data);
        assert_eq!(rs, spare);

        // Untouched pages read erased.
        reopened
            .read_page(PageIndex(6), &mut rd, &mut rs)
            .expect("read");
        assert!(rd.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn erase_wipes_the_containing_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bank.bin");
        let nand = FileNand::create(&path, NandBank::Slc, 128).expect("create");

        let data = [0_u8; PAGE_SIZE];
        let spare = [0_u8; PAGE_SPARE_SIZE];
        nand.program_page(PageIndex(5), &data, &spare).expect("program");
        nand.program_page(PageIndex(64), &data, &spare).expect("program");
        nand.erase_block(PageIndex(70)).expect("erase");

        let mut rd = [0_u8; PAGE_SIZE];
        let mut rs = [0_u8; PAGE_SPARE_SIZE];
        nand.read_page(PageIndex(64), &mut rd, &mut rs).expect("read");
        assert!(rd.iter().all(|&b| b == 0xFF));
        // The neighboring block is untouched.
        nand.read_page(PageIndex(5), &mut rd, &mut rs).expect("read");
        assert!(rd.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn truncated_dump_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.bin");
        std::fs::write(&path, vec![0_u8; RECORD_SIZE as usize + 17]).expect("write");
        assert!(matches!(
            FileNand::open(&path, NandBank::Slc),
            Err(MinuteError::Format(_))
        ));
    }

    #[test]
    fn sector_image_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sd.img");
        let dev = FileSectorDevice::create(&path, 32).expect("create");

        let out: Vec<u8> = (0..3 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        dev.write_sectors(SectorIndex(4), &out).expect("write");

        let reopened = FileSectorDevice::open(&path).expect("open");
        assert_eq!(reopened.sector_count(), 32);
        let mut back = vec![0_u8; out.len()];
        reopened.read_sectors(SectorIndex(4), &mut back).expect("read");
        assert_eq!(back, out);

        assert!(dev.write_sectors(SectorIndex(30), &out).is_err());
    }

    #[test]
    fn read_only_fallback_blocks_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ro.img");
        drop(FileSectorDevice::create(&path, 8).expect("create"));

        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).expect("chmod");

        let dev = FileSectorDevice::open(&path).expect("open");
        let buf = vec![0_u8; SECTOR_SIZE];
        let err = dev.write_sectors(SectorIndex(0), &buf).expect_err("read-only");
        assert!(matches!(err, MinuteError::Format(_)));

        let mut back = vec![0_u8; SECTOR_SIZE];
        dev.read_sectors(SectorIndex(0), &mut back).expect("read");
    }
}
