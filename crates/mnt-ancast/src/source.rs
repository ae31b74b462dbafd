//! The three fronts an ancast image is loaded from.
//!
//! Every boot path starts the same way: read the first 0x200 bytes, parse
//! the header out of them, then stream the full image into the load window.
//! [`ImageSource`] captures that probe/load split; the implementations
//! mirror the firmware's fronts, including the file front's 1 MiB staging
//! chunks and the SD front's deliberate rounding of the copy up to one
//! sector past the image end.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use mnt_error::{MinuteError, Result};
use mnt_nand::SectorDevice;
use mnt_types::{ParseError, SectorIndex, SECTOR_SIZE};
use tracing::debug;

/// Bytes the header probe reads; one SD sector exactly.
pub const ANCAST_PROBE_SIZE: usize = 0x200;
const _: () = assert!(ANCAST_PROBE_SIZE == SECTOR_SIZE);

/// Staging granularity of the file front.
const FILE_CHUNK_SIZE: usize = 0x10_0000;

/// Something an ancast image can be staged from.
pub trait ImageSource {
    /// Origin for log lines and error context.
    fn describe(&self) -> String;

    /// Fill `out` with the first [`ANCAST_PROBE_SIZE`] bytes of the image.
    ///
    /// A source shorter than the probe window zero-fills the tail, so a
    /// truncated image reads as garbage fields rather than an I/O fault.
    fn probe(&mut self, out: &mut [u8; ANCAST_PROBE_SIZE]) -> Result<()>;

    /// Copy the whole image, `total` bytes, to the front of `dest`.
    ///
    /// Implementations may write past `total` (never past `dest`) when the
    /// transfer granularity demands it.
    fn load(&mut self, total: usize, dest: &mut [u8]) -> Result<()>;
}

/// Image already sitting in memory; the single-copy front.
pub struct MemorySource<'a> {
    image: &'a [u8],
}

impl<'a> MemorySource<'a> {
    #[must_use]
    pub fn new(image: &'a [u8]) -> Self {
        Self { image }
    }
}

impl ImageSource for MemorySource<'_> {
    fn describe(&self) -> String {
        format!("memory image ({:#x} bytes)", self.image.len())
    }

    fn probe(&mut self, out: &mut [u8; ANCAST_PROBE_SIZE]) -> Result<()> {
        let have = self.image.len().min(ANCAST_PROBE_SIZE);
        out.fill(0);
        out[..have].copy_from_slice(&self.image[..have]);
        Ok(())
    }

    fn load(&mut self, total: usize, dest: &mut [u8]) -> Result<()> {
        if self.image.len() < total {
            return Err(ParseError::InsufficientData {
                needed: total,
                offset: 0,
                actual: self.image.len(),
            }
            .into());
        }
        dest[..total].copy_from_slice(&self.image[..total]);
        Ok(())
    }
}

/// Image file on the host; staged in [`FILE_CHUNK_SIZE`] chunks.
pub struct FileSource {
    path: PathBuf,
    file: File,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { path, file })
    }
}

impl ImageSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn probe(&mut self, out: &mut [u8; ANCAST_PROBE_SIZE]) -> Result<()> {
        self.file.rewind()?;
        out.fill(0);
        let mut filled = 0;
        while filled < out.len() {
            let count = self.file.read(&mut out[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(())
    }

    fn load(&mut self, total: usize, dest: &mut [u8]) -> Result<()> {
        self.file.rewind()?;
        let mut offset = 0;
        while offset < total {
            let len = FILE_CHUNK_SIZE.min(total - offset);
            self.file.read_exact(&mut dest[offset..offset + len])?;
            debug!(offset, len, total, "staged image chunk");
            offset += len;
        }
        Ok(())
    }
}

/// Raw sector range on an SD card or its image.
pub struct SectorSource<'d> {
    device: &'d dyn SectorDevice,
    first: SectorIndex,
}

impl<'d> SectorSource<'d> {
    #[must_use]
    pub fn new(device: &'d dyn SectorDevice, first: SectorIndex) -> Self {
        Self { device, first }
    }
}

impl ImageSource for SectorSource<'_> {
    fn describe(&self) -> String {
        format!("raw sector {}", self.first)
    }

    fn probe(&mut self, out: &mut [u8; ANCAST_PROBE_SIZE]) -> Result<()> {
        self.device.read_sectors(self.first, out.as_mut_slice())
    }

    fn load(&mut self, total: usize, dest: &mut [u8]) -> Result<()> {
        // One sector past the image end, always: `total / 0x200 + 1` whole
        // sectors. The copy is ragged but the window absorbs it.
        let num_sectors = total / SECTOR_SIZE + 1;
        let span = num_sectors
            .checked_mul(SECTOR_SIZE)
            .filter(|span| *span <= dest.len())
            .ok_or_else(|| {
                MinuteError::Format(format!(
                    "sector copy of {num_sectors} sectors spills past the \
                     {:#x}-byte load window",
                    dest.len()
                ))
            })?;
        dest[..total].fill(0);
        self.device.read_sectors(self.first, &mut dest[..span])?;
        debug!(first = %self.first, num_sectors, total, "staged image sectors");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnt_nand::MemSectorDevice;
    use std::io::Write;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn memory_probe_zero_fills_short_images() {
        let image = patterned(0x80);
        let mut source = MemorySource::new(&image);
        let mut probe = [0xFF_u8; ANCAST_PROBE_SIZE];
        source.probe(&mut probe).expect("probe");
        assert_eq!(&probe[..0x80], &image[..]);
        assert!(probe[0x80..].iter().all(|b| *b == 0));
    }

    #[test]
    fn memory_load_rejects_truncated_images() {
        let image = patterned(0x300);
        let mut source = MemorySource::new(&image);
        let mut dest = vec![0_u8; 0x1000];
        assert!(matches!(
            source.load(0x400, &mut dest),
            Err(MinuteError::Parse(ParseError::InsufficientData { .. }))
        ));
        source.load(0x300, &mut dest).expect("load");
        assert_eq!(&dest[..0x300], &image[..]);
    }

    #[test]
    fn file_front_stages_in_chunks() {
        let image = patterned(FILE_CHUNK_SIZE + 0x321);
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(&image).expect("write image");

        let mut source = FileSource::open(tmp.path()).expect("open");
        let mut probe = [0_u8; ANCAST_PROBE_SIZE];
        source.probe(&mut probe).expect("probe");
        assert_eq!(&probe[..], &image[..ANCAST_PROBE_SIZE]);

        // The probe does not consume the image; load restarts from byte 0.
        let mut dest = vec![0_u8; image.len()];
        source.load(image.len(), &mut dest).expect("load");
        assert_eq!(dest, image);
    }

    #[test]
    fn file_load_fails_on_short_file() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(&patterned(0x100)).expect("write image");

        let mut source = FileSource::open(tmp.path()).expect("open");
        let mut dest = vec![0_u8; 0x1000];
        assert!(matches!(
            source.load(0x200, &mut dest),
            Err(MinuteError::Io(_))
        ));
    }

    #[test]
    fn sector_front_rounds_the_copy_up() {
        let device = MemSectorDevice::new(64);
        let image = patterned(3 * SECTOR_SIZE);
        device.write_sectors(SectorIndex(8), &image).expect("seed");

        let mut source = SectorSource::new(&device, SectorIndex(8));
        let mut probe = [0_u8; ANCAST_PROBE_SIZE];
        source.probe(&mut probe).expect("probe");
        assert_eq!(&probe[..], &image[..SECTOR_SIZE]);

        // total of 2.5 sectors reads 3 whole sectors into the window.
        let total = 2 * SECTOR_SIZE + SECTOR_SIZE / 2;
        let mut dest = vec![0xEE_u8; 8 * SECTOR_SIZE];
        source.load(total, &mut dest).expect("load");
        assert_eq!(&dest[..3 * SECTOR_SIZE], &image[..]);
        assert!(dest[3 * SECTOR_SIZE..].iter().all(|b| *b == 0xEE));

        // An exact-sector total still rounds one sector past the end.
        let mut dest = vec![0_u8; 8 * SECTOR_SIZE];
        source.load(2 * SECTOR_SIZE, &mut dest).expect("load");
        assert_eq!(&dest[..3 * SECTOR_SIZE], &image[..]);
    }

    #[test]
    fn sector_rounding_must_fit_the_window() {
        let device = MemSectorDevice::new(64);
        let mut source = SectorSource::new(&device, SectorIndex(0));
        let mut dest = vec![0_u8; 2 * SECTOR_SIZE];
        // 2 sectors of payload + the rounding sector need 3 sectors of room.
        assert!(matches!(
            source.load(2 * SECTOR_SIZE, &mut dest),
            Err(MinuteError::Format(_))
        ));
    }
}
