//! Record table lifecycle over the persistent window.

use mnt_crypto::{decrypt_cbc, encrypt_cbc, Otp, PRSH_IV};
use mnt_error::{MinuteError, Result};
use mnt_ondisk::prsh::{
    header_checksum, PRSH_DEFAULT_CAPACITY, PRSH_HEADER_SIZE, PRSH_IS_SET, PRSH_MAGIC,
    PRSH_RECORD_SIZE,
};
use mnt_ondisk::{PrshHeader, PrshRecord, PrstTrailer};
use mnt_types::{BOOT_INFO_ADDR, BOOT_INFO_SIZE, PRSH_HEADER_ADDR, REGION_PRSH};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Offset of the header the firmware creates, relative to the window base.
pub const PRSH_WINDOW_HEADER_OFFSET: usize = (PRSH_HEADER_ADDR - REGION_PRSH.base) as usize;

/// How [`PrshStore::init`] obtained its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    /// A valid table was found in the window and adopted as is.
    Inherited,
    /// The window held no valid table; it was zeroed and reseeded.
    Recreated,
}

/// The record table plus the window bytes it lives in.
///
/// The store owns a deciphered working copy of the whole window. Records
/// name memory blocks elsewhere in RAM; the store tracks the pointers but
/// never touches the pointed-at memory.
pub struct PrshStore {
    bytes: Vec<u8>,
    header_off: usize,
    header: PrshHeader,
}

impl PrshStore {
    /// Adopt or rebuild the table in a freshly captured window.
    ///
    /// `bytes` is the raw window content, still ciphered when the console
    /// is fused for it. A table is inherited only if its capacity is sane,
    /// its span fits the window, and both checksums hold; anything else is
    /// zeroed and reseeded with the bootstrap `boot_info` record.
    pub fn init(mut bytes: Vec<u8>, otp: &Otp) -> Result<(Self, InitOutcome)> {
        if bytes.len() != REGION_PRSH.len as usize {
            return Err(MinuteError::Format(format!(
                "persistent window must be {:#x} bytes, got {:#x}",
                REGION_PRSH.len,
                bytes.len()
            )));
        }
        decrypt_region(&mut bytes, otp)?;

        if let Some(header_off) = find_header(&bytes) {
            if let Some(header) = try_inherit(&bytes, header_off) {
                debug!(
                    offset = header_off,
                    entries = header.entries,
                    capacity = header.total_entries,
                    "inherited persistent record table"
                );
                return Ok((
                    Self {
                        bytes,
                        header_off,
                        header,
                    },
                    InitOutcome::Inherited,
                ));
            }
        } else {
            debug!("no persistent record table in the window");
        }

        let store = Self::recreate(bytes)?;
        Ok((store, InitOutcome::Recreated))
    }

    /// Zero the window and seed a fresh table at the fixed offset.
    fn recreate(mut bytes: Vec<u8>) -> Result<Self> {
        bytes.fill(0);

        let capacity = PRSH_DEFAULT_CAPACITY;
        let size = (PRSH_HEADER_SIZE + PRSH_RECORD_SIZE * capacity as usize) as u32;
        let header = PrshHeader {
            checksum: 0,
            version: 1,
            size,
            is_boot1: 1,
            total_entries: capacity,
            entries: 1,
        };
        let mut store = Self {
            bytes,
            header_off: PRSH_WINDOW_HEADER_OFFSET,
            header,
        };

        let bootstrap = PrshRecord {
            name: "boot_info".to_owned(),
            data_addr: BOOT_INFO_ADDR,
            size: BOOT_INFO_SIZE,
            is_set: PRSH_IS_SET,
        };
        let record_off = store.record_off(0);
        bootstrap.write_to(&mut store.bytes[record_off..])?;

        let trailer = PrstTrailer {
            checksum: 0,
            size,
            is_set: 1,
        };
        let trailer_off = store.trailer_off();
        trailer.write_to(&mut store.bytes[trailer_off..])?;

        store.sync_checksums()?;
        debug!(
            offset = store.header_off,
            capacity, "rebuilt the persistent record table"
        );
        Ok(store)
    }

    #[must_use]
    pub fn header(&self) -> PrshHeader {
        self.header
    }

    /// Offset of the adopted header within the window.
    #[must_use]
    pub fn header_offset(&self) -> usize {
        self.header_off
    }

    /// The deciphered window content.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// All in-use records in table order.
    pub fn entries(&self) -> Result<Vec<PrshRecord>> {
        (0..self.header.entries).map(|index| self.record(index)).collect()
    }

    /// Look a record up by its fixed-width name.
    pub fn find_entry(&self, name: &str) -> Result<PrshRecord> {
        match self.find_index(name)? {
            Some((_, record)) => Ok(record),
            None => Err(MinuteError::NotFound { name: name.to_owned() }),
        }
    }

    /// Repoint an existing record. Unknown names are an error; the boot
    /// stages never create records implicitly.
    pub fn set_entry(&mut self, name: &str, data_addr: u32, size: u32) -> Result<()> {
        match self.find_index(name)? {
            Some((index, record)) => self.update_record(index, record, data_addr, size),
            None => Err(MinuteError::NotFound { name: name.to_owned() }),
        }
    }

    /// Repoint an existing record or append a new one.
    pub fn add_entry(&mut self, name: &str, data_addr: u32, size: u32) -> Result<()> {
        match self.find_index(name)? {
            Some((index, record)) => self.update_record(index, record, data_addr, size),
            None => self.append_record(name, data_addr, size),
        }
    }

    /// Recompute both checksums and compare against the stored words.
    pub fn is_checksum_valid(&self) -> Result<bool> {
        let computed = header_checksum(&self.bytes[self.header_off..], self.header.entries)?;
        let trailer = PrstTrailer::parse(&self.bytes[self.trailer_off()..])?;
        Ok(computed == self.header.checksum && trailer.checksum == trailer.expected_checksum())
    }

    /// Give the window back for the next stage, ciphering it when the
    /// console is fused for that.
    pub fn handoff(mut self, otp: &Otp) -> Result<Vec<u8>> {
        encrypt_region(&mut self.bytes, otp)?;
        Ok(self.bytes)
    }

    fn record_off(&self, index: u32) -> usize {
        self.header_off + PRSH_HEADER_SIZE + index as usize * PRSH_RECORD_SIZE
    }

    fn trailer_off(&self) -> usize {
        self.record_off(self.header.total_entries)
    }

    fn record(&self, index: u32) -> Result<PrshRecord> {
        let off = self.record_off(index);
        Ok(PrshRecord::parse(&self.bytes[off..])?)
    }

    fn find_index(&self, name: &str) -> Result<Option<(u32, PrshRecord)>> {
        for index in 0..self.header.entries {
            let record = self.record(index)?;
            if record.name_matches(name) {
                return Ok(Some((index, record)));
            }
        }
        Ok(None)
    }

    fn update_record(
        &mut self,
        index: u32,
        mut record: PrshRecord,
        data_addr: u32,
        size: u32,
    ) -> Result<()> {
        record.data_addr = data_addr;
        record.size = size;
        record.is_set = PRSH_IS_SET;
        let off = self.record_off(index);
        record.write_fields_to(&mut self.bytes[off..])?;
        self.sync_checksums()?;
        debug!(name = %record.name, data_addr, size, "record updated");
        Ok(())
    }

    fn append_record(&mut self, name: &str, data_addr: u32, size: u32) -> Result<()> {
        if self.header.entries >= self.header.total_entries {
            return Err(MinuteError::RecordTableFull);
        }
        let record = PrshRecord {
            name: name.to_owned(),
            data_addr,
            size,
            is_set: PRSH_IS_SET,
        };
        let off = self.record_off(self.header.entries);
        record.write_to(&mut self.bytes[off..])?;
        self.header.entries += 1;
        self.sync_checksums()?;
        debug!(name, data_addr, size, entries = self.header.entries, "record appended");
        Ok(())
    }

    /// Rewrite the header and trailer with checksums matching the buffer.
    ///
    /// The header checksum span starts one word past the checksum field, so
    /// the header is serialized first and the checksum folded in after.
    fn sync_checksums(&mut self) -> Result<()> {
        self.header.write_to(&mut self.bytes[self.header_off..])?;
        self.header.checksum = header_checksum(&self.bytes[self.header_off..], self.header.entries)?;
        self.header.write_to(&mut self.bytes[self.header_off..])?;

        let off = self.trailer_off();
        let mut trailer = PrstTrailer::parse(&self.bytes[off..])?;
        trailer.checksum = trailer.expected_checksum();
        trailer.write_to(&mut self.bytes[off..])?;
        Ok(())
    }
}

/// Word-scan for the magic. The header starts one word before the match,
/// so a match in the window's first word cannot carry a table.
fn find_header(bytes: &[u8]) -> Option<usize> {
    let magic = PRSH_MAGIC.to_be_bytes();
    (4..bytes.len().saturating_sub(3))
        .step_by(4)
        .find(|off| bytes[*off..*off + 4] == magic)
        .map(|off| off - 4)
}

/// Validate a table found at `header_off`, in checking order: capacity
/// bound before anything derived from it, then the table span, then the
/// trailer, then both checksums.
fn try_inherit(bytes: &[u8], header_off: usize) -> Option<PrshHeader> {
    let header = match PrshHeader::parse(&bytes[header_off..]) {
        Ok(header) => header,
        Err(err) => {
            warn!(%err, "persistent header unreadable");
            return None;
        }
    };
    if header.is_corrupt() {
        warn!(capacity = header.total_entries, "persistent table capacity out of bounds");
        return None;
    }
    if header.entries > header.total_entries {
        warn!(
            entries = header.entries,
            capacity = header.total_entries,
            "persistent table claims more records than it can hold"
        );
        return None;
    }

    let trailer_off = header_off + PRSH_HEADER_SIZE + header.total_entries as usize * PRSH_RECORD_SIZE;
    let trailer = match PrstTrailer::parse(bytes.get(trailer_off..).unwrap_or_default()) {
        Ok(trailer) => trailer,
        Err(err) => {
            warn!(%err, "persistent table trailer unreadable");
            return None;
        }
    };
    if trailer.checksum != trailer.expected_checksum() {
        warn!("persistent table trailer checksum mismatch");
        return None;
    }

    let computed = match header_checksum(&bytes[header_off..], header.entries) {
        Ok(checksum) => checksum,
        Err(err) => {
            warn!(%err, "persistent table checksum span out of bounds");
            return None;
        }
    };
    if computed != header.checksum {
        warn!(
            stored = header.checksum,
            computed, "persistent table checksum mismatch"
        );
        return None;
    }
    Some(header)
}

/// Decipher a captured window in place. No-op (returning `false`) unless
/// the console's fuses enable window crypto.
pub fn decrypt_region(bytes: &mut [u8], otp: &Otp) -> Result<bool> {
    if !otp.prsh_crypto_enabled() {
        return Ok(false);
    }
    decrypt_cbc(&otp.fw_ancast_key(), &PRSH_IV, bytes)?;
    Ok(true)
}

/// Cipher a window for handoff. Same gate as [`decrypt_region`].
pub fn encrypt_region(bytes: &mut [u8], otp: &Otp) -> Result<bool> {
    if !otp.prsh_crypto_enabled() {
        return Ok(false);
    }
    encrypt_cbc(&otp.fw_ancast_key(), &PRSH_IV, bytes)?;
    Ok(true)
}
