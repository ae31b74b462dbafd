//! SEEPROM board-configuration image layout.
//!
//! The 0x200-byte EEPROM dump carries production markers, the "bc" board
//! config (CRC32 over 0x20 bytes starting at its size field), and three
//! AES-encrypted 16-byte parameter blocks (hardware params plus primary and
//! backup boot1 params, each 0xC bytes of data followed by its CRC32,
//! encrypted as one unit). This module is layout only; CRC and cipher
//! checks live with the key material.

use mnt_types::{
    ensure_slice_mut, read_be_u16, read_be_u32, read_fixed, write_be_u16, ParseError,
};
use serde::{Deserialize, Serialize};

pub const SEEPROM_SIZE: usize = 0x200;

pub const SEEPROM_TIMESTAMP_OFFSET: usize = 0x0A0;
pub const SEEPROM_TIMESTAMP_CRC_OFFSET: usize = 0x0A4;
pub const SEEPROM_MARKER_AA55_OFFSET: usize = 0x0A8;
pub const SEEPROM_MARKER_BB66_OFFSET: usize = 0x0AA;

pub const SEEPROM_BC_CRC_OFFSET: usize = 0x100;
pub const SEEPROM_BC_SIZE_OFFSET: usize = 0x104;
pub const SEEPROM_BC_PAYLOAD_OFFSET: usize = 0x106;
/// Payload bytes after the size field.
pub const SEEPROM_BC_PAYLOAD_LEN: usize = 0x1E;
/// Expected value of the bc size field (crc word + size word + payload).
pub const SEEPROM_BC_SIZE: u16 = 0x24;

pub const SEEPROM_HW_PARAMS_OFFSET: usize = 0x1D0;
pub const SEEPROM_BOOT1_PARAMS_OFFSET: usize = 0x1E0;
pub const SEEPROM_BOOT1_COPY_OFFSET: usize = 0x1F0;
/// Each parameter block is one AES block: 0xC data bytes plus its CRC32.
pub const SEEPROM_PARAM_BLOCK_SIZE: usize = 0x10;
pub const SEEPROM_PARAM_DATA_SIZE: usize = 0xC;

pub const SEEPROM_MARKER_AA55: u16 = 0xAA55;
pub const SEEPROM_MARKER_BB66: u16 = 0xBB66;

/// Board config substituted when the stored bc fails its CRC.
pub const BC_DEFAULT_PAYLOAD: [u8; SEEPROM_BC_PAYLOAD_LEN] = [
    0x00, 0x04, // library version
    0x40, 0x4D, 0x43, 0x46, // author
    0x00, 0x0B, // board type
    0x4E, 0x31, // board revision
    0x08, 0x00, // boot source
    0x00, 0x02, 0x00, 0x05, 0x00, 0x02, 0x00, 0x01, // clock/memory params
    0x55, 0x21, 0x00, 0x00, 0x00, 0xF8, 0x00, 0x03, // console params
    0x00, 0x01,
];

/// One of the three encrypted parameter slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamSlot {
    HwParams,
    Boot1Params,
    Boot1Copy,
}

impl ParamSlot {
    #[must_use]
    pub fn offset(self) -> usize {
        match self {
            Self::HwParams => SEEPROM_HW_PARAMS_OFFSET,
            Self::Boot1Params => SEEPROM_BOOT1_PARAMS_OFFSET,
            Self::Boot1Copy => SEEPROM_BOOT1_COPY_OFFSET,
        }
    }
}

/// The board config block as stored: CRC, size field, opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub crc: u32,
    pub size: u16,
    pub payload: [u8; SEEPROM_BC_PAYLOAD_LEN],
}

/// Decrypted boot1 parameter data (first 0xC bytes of a parameter block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boot1Params {
    pub version: u16,
    pub sector: u16,
    pub reserved: [u8; 8],
}

impl Boot1Params {
    /// Parse from a decrypted 16-byte parameter block (or just its data).
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            version: read_be_u16(block, 0x0)?,
            sector: read_be_u16(block, 0x2)?,
            reserved: read_fixed::<8>(block, 0x4)?,
        })
    }

    pub fn write_to(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_be_u16(block, 0x0, self.version)?;
        write_be_u16(block, 0x2, self.sector)?;
        ensure_slice_mut(block, 0x4, 8)?.copy_from_slice(&self.reserved);
        Ok(())
    }
}

/// An owned SEEPROM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seeprom {
    buf: Vec<u8>,
}

impl Seeprom {
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, ParseError> {
        if buf.len() != SEEPROM_SIZE {
            return Err(ParseError::InvalidField {
                field: "seeprom",
                reason: "not a 0x200-byte image",
            });
        }
        Ok(Self { buf })
    }

    pub fn production_timestamp(&self) -> Result<u32, ParseError> {
        read_be_u32(&self.buf, SEEPROM_TIMESTAMP_OFFSET)
    }

    pub fn stored_timestamp_crc(&self) -> Result<u32, ParseError> {
        read_be_u32(&self.buf, SEEPROM_TIMESTAMP_CRC_OFFSET)
    }

    /// The bytes the timestamp CRC is computed over.
    #[must_use]
    pub fn timestamp_crc_input(&self) -> &[u8] {
        &self.buf[SEEPROM_TIMESTAMP_OFFSET..SEEPROM_TIMESTAMP_OFFSET + 4]
    }

    pub fn marker_aa55(&self) -> Result<u16, ParseError> {
        read_be_u16(&self.buf, SEEPROM_MARKER_AA55_OFFSET)
    }

    pub fn marker_bb66(&self) -> Result<u16, ParseError> {
        read_be_u16(&self.buf, SEEPROM_MARKER_BB66_OFFSET)
    }

    pub fn board_config(&self) -> Result<BoardConfig, ParseError> {
        Ok(BoardConfig {
            crc: read_be_u32(&self.buf, SEEPROM_BC_CRC_OFFSET)?,
            size: read_be_u16(&self.buf, SEEPROM_BC_SIZE_OFFSET)?,
            payload: read_fixed::<SEEPROM_BC_PAYLOAD_LEN>(&self.buf, SEEPROM_BC_PAYLOAD_OFFSET)?,
        })
    }

    /// The 0x20 bytes the bc CRC is computed over (size field plus payload).
    #[must_use]
    pub fn bc_crc_input(&self) -> &[u8] {
        &self.buf[SEEPROM_BC_SIZE_OFFSET..SEEPROM_BC_SIZE_OFFSET + 0x20]
    }

    /// Replace the stored bc with the documented default, as done when the
    /// stored copy fails its CRC.
    pub fn install_default_bc(&mut self) -> Result<(), ParseError> {
        write_be_u16(&mut self.buf, SEEPROM_BC_SIZE_OFFSET, SEEPROM_BC_SIZE)?;
        ensure_slice_mut(&mut self.buf, SEEPROM_BC_PAYLOAD_OFFSET, SEEPROM_BC_PAYLOAD_LEN)?
            .copy_from_slice(&BC_DEFAULT_PAYLOAD);
        Ok(())
    }

    /// Raw 16-byte parameter block (encrypted at rest).
    pub fn param_block(&self, slot: ParamSlot) -> Result<[u8; SEEPROM_PARAM_BLOCK_SIZE], ParseError> {
        read_fixed::<SEEPROM_PARAM_BLOCK_SIZE>(&self.buf, slot.offset())
    }

    pub fn set_param_block(
        &mut self,
        slot: ParamSlot,
        block: &[u8; SEEPROM_PARAM_BLOCK_SIZE],
    ) -> Result<(), ParseError> {
        ensure_slice_mut(&mut self.buf, slot.offset(), SEEPROM_PARAM_BLOCK_SIZE)?
            .copy_from_slice(block);
        Ok(())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
