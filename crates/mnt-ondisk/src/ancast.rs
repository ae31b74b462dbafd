//! Ancast container header parsing.
//!
//! An ancast image is `[magic .. signature block .. header .. body]`. The
//! signature block's type (read indirectly through the offset field at byte
//! 8) fixes where the 0x60-byte header sits: 0xA0 for type 0x01, 0x1A0 for
//! type 0x02. The body always starts at `header_offset + 0x60`, i.e. 0x100
//! or 0x200. All fields are big-endian.

use mnt_types::{
    ensure_slice, ensure_slice_mut, read_be_u16, read_be_u32, read_fixed, write_be_u16,
    write_be_u32, ANCAST_HEADER_OFFSET_SIG1, ANCAST_HEADER_OFFSET_SIG2, ANCAST_HEADER_SIZE,
    ANCAST_MAGIC, ANCAST_SIG_OFFSET_FIELD, ANCAST_TARGET_IOP, ANCAST_TARGET_PPC, ParseError,
};
use serde::{Deserialize, Serialize};

/// Parsed ancast image header, including the signature-block framing needed
/// to locate the body.
///
/// `unk1`/`unk2`/`unk3` are carried raw; only bit 0 of `unk1` has known
/// meaning (body is plaintext when set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncastHeader {
    pub sig_offset: u32,
    pub sig_type: u32,
    pub header_offset: usize,

    pub unk1: u16,
    pub unk2: u8,
    pub unk3: u8,
    /// Packed target (high nibble of the low byte) and device id.
    pub device: u32,
    pub image_type: u32,
    pub body_size: u32,
    pub body_hash: [u8; 20],
    pub version: u32,
}

impl AncastHeader {
    /// Parse an ancast header from the start of an image.
    ///
    /// Needs the first 0x100 (signature type 0x01) or 0x200 (type 0x02)
    /// bytes; passing the whole image is fine.
    pub fn parse(image: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(image, 0)?;
        if magic != ANCAST_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(ANCAST_MAGIC),
                actual: u64::from(magic),
            });
        }

        let sig_offset = read_be_u32(image, ANCAST_SIG_OFFSET_FIELD)?;
        let sig_offset_usize =
            usize::try_from(sig_offset).map_err(|_| ParseError::IntegerConversion {
                field: "sig_offset",
            })?;
        let sig_type = read_be_u32(image, sig_offset_usize)?;

        let header_offset = match sig_type {
            0x01 => ANCAST_HEADER_OFFSET_SIG1,
            0x02 => ANCAST_HEADER_OFFSET_SIG2,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "sig_type",
                    reason: "unrecognized signature type",
                });
            }
        };

        // Single-byte fields via ensure_slice
        let unk2 = ensure_slice(image, header_offset + 2, 1)?[0];
        let unk3 = ensure_slice(image, header_offset + 3, 1)?[0];

        Ok(Self {
            sig_offset,
            sig_type,
            header_offset,
            unk1: read_be_u16(image, header_offset)?,
            unk2,
            unk3,
            device: read_be_u32(image, header_offset + 0x04)?,
            image_type: read_be_u32(image, header_offset + 0x08)?,
            body_size: read_be_u32(image, header_offset + 0x0C)?,
            body_hash: read_fixed::<20>(image, header_offset + 0x10)?,
            version: read_be_u32(image, header_offset + 0x24)?,
        })
    }

    /// Bytes before the body: signature framing plus the 0x60-byte header.
    #[must_use]
    pub fn header_size(&self) -> usize {
        self.header_offset + ANCAST_HEADER_SIZE
    }

    /// Full image size, `None` on address-space overflow.
    #[must_use]
    pub fn total_size(&self) -> Option<usize> {
        self.header_size().checked_add(self.body_size as usize)
    }

    /// Target processor nibble (`ANCAST_TARGET_PPC` / `ANCAST_TARGET_IOP`).
    ///
    /// Keeps the full 8-bit take of the original comparison, so corrupted
    /// high bits fail the target match instead of aliasing.
    #[must_use]
    pub fn target(&self) -> u8 {
        (self.device >> 4) as u8
    }

    /// Low device-id nibble.
    #[must_use]
    pub fn device_id(&self) -> u8 {
        (self.device & 0xF) as u8
    }

    #[must_use]
    pub fn is_ppc(&self) -> bool {
        self.target() == ANCAST_TARGET_PPC
    }

    #[must_use]
    pub fn is_iop(&self) -> bool {
        self.target() == ANCAST_TARGET_IOP
    }

    /// Bit 0 of `unk1` set means the body is stored unencrypted.
    #[must_use]
    pub fn body_is_plaintext(&self) -> bool {
        self.unk1 & 0b1 != 0
    }

    /// Serialize the magic, signature framing and header fields into an
    /// image buffer. Signature payload bytes and the body are left alone.
    pub fn write_to(&self, image: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(image, 0, ANCAST_MAGIC)?;
        write_be_u32(image, ANCAST_SIG_OFFSET_FIELD, self.sig_offset)?;
        let sig_offset_usize =
            usize::try_from(self.sig_offset).map_err(|_| ParseError::IntegerConversion {
                field: "sig_offset",
            })?;
        write_be_u32(image, sig_offset_usize, self.sig_type)?;

        let off = self.header_offset;
        write_be_u16(image, off, self.unk1)?;
        ensure_slice_mut(image, off + 2, 2)?.copy_from_slice(&[self.unk2, self.unk3]);
        write_be_u32(image, off + 0x04, self.device)?;
        write_be_u32(image, off + 0x08, self.image_type)?;
        write_be_u32(image, off + 0x0C, self.body_size)?;
        ensure_slice_mut(image, off + 0x10, 20)?.copy_from_slice(&self.body_hash);
        write_be_u32(image, off + 0x24, self.version)?;
        Ok(())
    }
}

/// Mini-header at the start of an IOP ancast body; the boot vector sits
/// `header_size` bytes past the body start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IosHeader {
    pub header_size: u32,
    pub loader_size: u32,
    pub elf_size: u32,
    pub ddr_init: u32,
}

impl IosHeader {
    pub const SIZE: usize = 0x10;

    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            header_size: read_be_u32(body, 0x0)?,
            loader_size: read_be_u32(body, 0x4)?,
            elf_size: read_be_u32(body, 0x8)?,
            ddr_init: read_be_u32(body, 0xC)?,
        })
    }

    pub fn write_to(&self, body: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(body, 0x0, self.header_size)?;
        write_be_u32(body, 0x4, self.loader_size)?;
        write_be_u32(body, 0x8, self.elf_size)?;
        write_be_u32(body, 0xC, self.ddr_init)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header(sig_type: u32) -> (Vec<u8>, AncastHeader) {
        let header_offset = match sig_type {
            0x01 => ANCAST_HEADER_OFFSET_SIG1,
            _ => ANCAST_HEADER_OFFSET_SIG2,
        };
        let header = AncastHeader {
            sig_offset: 0x20,
            sig_type,
            header_offset,
            unk1: 0,
            unk2: 0,
            unk3: 0,
            device: 0x21,
            image_type: 0x02,
            body_size: 0x1000,
            body_hash: [0xAB; 20],
            version: 0x5101,
        };
        let mut image = vec![0_u8; header_offset + ANCAST_HEADER_SIZE];
        header.write_to(&mut image).expect("serialize header");
        (image, header)
    }

    #[test]
    fn parse_round_trips_both_signature_types() {
        for sig_type in [0x01, 0x02] {
            let (image, expected) = make_header(sig_type);
            let parsed = AncastHeader::parse(&image).expect("parse");
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn header_and_total_sizes() {
        let (image, _) = make_header(0x01);
        let parsed = AncastHeader::parse(&image).expect("parse");
        assert_eq!(parsed.header_size(), 0x100);
        assert_eq!(parsed.total_size(), Some(0x1100));

        let (image, _) = make_header(0x02);
        let parsed = AncastHeader::parse(&image).expect("parse");
        assert_eq!(parsed.header_size(), 0x200);
        assert_eq!(parsed.total_size(), Some(0x1200));
    }

    #[test]
    fn rejects_bad_magic() {
        let (mut image, _) = make_header(0x01);
        image[0] ^= 0xFF;
        assert!(matches!(
            AncastHeader::parse(&image),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_unknown_signature_type() {
        let (mut image, _) = make_header(0x01);
        image[0x20..0x24].copy_from_slice(&3_u32.to_be_bytes());
        assert!(matches!(
            AncastHeader::parse(&image),
            Err(ParseError::InvalidField {
                field: "sig_type",
                ..
            })
        ));
    }

    #[test]
    fn rejects_truncated_image() {
        let (image, _) = make_header(0x02);
        assert!(matches!(
            AncastHeader::parse(&image[..0x1A4]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn target_and_device_nibbles() {
        let (image, _) = make_header(0x01);
        let parsed = AncastHeader::parse(&image).expect("parse");
        assert_eq!(parsed.target(), ANCAST_TARGET_IOP);
        assert_eq!(parsed.device_id(), 1);
        assert!(parsed.is_iop());
        assert!(!parsed.is_ppc());
    }

    #[test]
    fn corrupt_target_high_bits_do_not_alias() {
        let (mut image, mut header) = make_header(0x01);
        header.device = 0x121; // target byte becomes 0x12
        header.write_to(&mut image).expect("serialize");
        let parsed = AncastHeader::parse(&image).expect("parse");
        assert!(!parsed.is_ppc());
        assert!(!parsed.is_iop());
    }

    #[test]
    fn plaintext_flag() {
        let (mut image, mut header) = make_header(0x01);
        assert!(!AncastHeader::parse(&image).expect("parse").body_is_plaintext());

        header.unk1 = 1;
        header.write_to(&mut image).expect("serialize");
        assert!(AncastHeader::parse(&image).expect("parse").body_is_plaintext());
    }

    #[test]
    fn ios_header_round_trip() {
        let header = IosHeader {
            header_size: 0x1000,
            loader_size: 0x2000,
            elf_size: 0x30000,
            ddr_init: 0,
        };
        let mut body = [0_u8; IosHeader::SIZE];
        header.write_to(&mut body).expect("serialize");
        assert_eq!(IosHeader::parse(&body).expect("parse"), header);
        assert_eq!(body[..8], [0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x20, 0x00]);
    }
}
