//! Read-only view of the 0x400-byte OTP fuse dump.
//!
//! The console burns its per-device secrets into one-time-programmable
//! fuses; tools work from a dump of that bank. Two NAND key sets coexist:
//! the Wii-era pair used by the compat flash bank and the Wii U pair used by
//! the native one. Superblock version selects between them.

use mnt_types::ParseError;

use crate::aes::AES_KEY_LEN;
use crate::hash::HMAC_KEY_LEN;

/// Size of a full fuse-bank dump.
pub const OTP_SIZE: usize = 0x400;

pub const OTP_WII_NAND_HMAC_OFFSET: usize = 0x044;
pub const OTP_WII_NAND_KEY_OFFSET: usize = 0x058;
pub const OTP_SECURITY_LEVEL_OFFSET: usize = 0x080;
pub const OTP_FW_ANCAST_KEY_OFFSET: usize = 0x090;
pub const OTP_SEEPROM_KEY_OFFSET: usize = 0x0A0;
pub const OTP_NAND_HMAC_OFFSET: usize = 0x180;
pub const OTP_NAND_KEY_OFFSET: usize = 0x194;
pub const OTP_JTAG_STATUS_OFFSET: usize = 0x3FC;

/// Security-level bit gating at-rest encryption of the persistent store.
pub const OTP_SECURITY_PRSH_CRYPTO: u32 = 0x8000_0000;

/// An owned OTP dump with typed accessors for the fields the storage core
/// consumes. Loaded from a buffer or file; talking to the fuse hardware is
/// out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Otp {
    buf: [u8; OTP_SIZE],
}

impl Otp {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != OTP_SIZE {
            return Err(ParseError::InvalidField {
                field: "otp",
                reason: "not a 0x400-byte fuse dump",
            });
        }
        let mut buf = [0_u8; OTP_SIZE];
        buf.copy_from_slice(data);
        Ok(Self { buf })
    }

    fn bytes_at<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0_u8; N];
        out.copy_from_slice(&self.buf[offset..offset + N]);
        out
    }

    fn word_at(&self, offset: usize) -> u32 {
        u32::from_be_bytes(self.bytes_at(offset))
    }

    // ── Key material ───────────────────────────────────────────────────────

    /// AES key for ancast firmware bodies.
    #[must_use]
    pub fn fw_ancast_key(&self) -> [u8; AES_KEY_LEN] {
        self.bytes_at(OTP_FW_ANCAST_KEY_OFFSET)
    }

    /// AES key for the encrypted SEEPROM parameter blocks.
    #[must_use]
    pub fn seeprom_key(&self) -> [u8; AES_KEY_LEN] {
        self.bytes_at(OTP_SEEPROM_KEY_OFFSET)
    }

    /// Wii U bank NAND AES key.
    #[must_use]
    pub fn nand_key(&self) -> [u8; AES_KEY_LEN] {
        self.bytes_at(OTP_NAND_KEY_OFFSET)
    }

    /// Wii U bank NAND HMAC key.
    #[must_use]
    pub fn nand_hmac(&self) -> [u8; HMAC_KEY_LEN] {
        self.bytes_at(OTP_NAND_HMAC_OFFSET)
    }

    /// Wii-era NAND AES key (compat bank).
    #[must_use]
    pub fn wii_nand_key(&self) -> [u8; AES_KEY_LEN] {
        self.bytes_at(OTP_WII_NAND_KEY_OFFSET)
    }

    /// Wii-era NAND HMAC key (compat bank).
    #[must_use]
    pub fn wii_nand_hmac(&self) -> [u8; HMAC_KEY_LEN] {
        self.bytes_at(OTP_WII_NAND_HMAC_OFFSET)
    }

    /// NAND AES key for a filesystem of the given superblock version.
    /// Version 0 volumes (compat bank) use the Wii keys.
    #[must_use]
    pub fn isfs_aes_key(&self, version: u8) -> [u8; AES_KEY_LEN] {
        if version == 0 {
            self.wii_nand_key()
        } else {
            self.nand_key()
        }
    }

    /// NAND HMAC key for a filesystem of the given superblock version.
    #[must_use]
    pub fn isfs_hmac_key(&self, version: u8) -> [u8; HMAC_KEY_LEN] {
        if version == 0 {
            self.wii_nand_hmac()
        } else {
            self.nand_hmac()
        }
    }

    // ── Status words ───────────────────────────────────────────────────────

    #[must_use]
    pub fn security_level(&self) -> u32 {
        self.word_at(OTP_SECURITY_LEVEL_OFFSET)
    }

    #[must_use]
    pub fn jtag_status(&self) -> u32 {
        self.word_at(OTP_JTAG_STATUS_OFFSET)
    }

    /// Whether the persistent store must be kept encrypted at rest.
    #[must_use]
    pub fn prsh_crypto_enabled(&self) -> bool {
        self.security_level() & OTP_SECURITY_PRSH_CRYPTO != 0
    }

    /// Detects a dump taken after the fuse bank was blanked from the tail:
    /// such dumps carry data only below the ancast-key region. Counts
    /// trailing zero bytes backward, skipping the JTAG status word.
    #[must_use]
    pub fn is_defused(&self) -> bool {
        let mut loaded = OTP_SIZE - 1;
        let mut offset = OTP_SIZE - 5;
        while offset > 0 && self.buf[offset] == 0 {
            loaded -= 1;
            offset -= 1;
        }
        loaded <= OTP_FW_ANCAST_KEY_OFFSET
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned() -> Otp {
        let mut buf = vec![0_u8; OTP_SIZE];
        buf[OTP_WII_NAND_HMAC_OFFSET..OTP_WII_NAND_HMAC_OFFSET + HMAC_KEY_LEN].fill(0xA1);
        buf[OTP_WII_NAND_KEY_OFFSET..OTP_WII_NAND_KEY_OFFSET + AES_KEY_LEN].fill(0xA2);
        buf[OTP_SECURITY_LEVEL_OFFSET..OTP_SECURITY_LEVEL_OFFSET + 4]
            .copy_from_slice(&0x9000_0000_u32.to_be_bytes());
        buf[OTP_FW_ANCAST_KEY_OFFSET..OTP_FW_ANCAST_KEY_OFFSET + AES_KEY_LEN].fill(0xB1);
        buf[OTP_SEEPROM_KEY_OFFSET..OTP_SEEPROM_KEY_OFFSET + AES_KEY_LEN].fill(0xB2);
        buf[OTP_NAND_HMAC_OFFSET..OTP_NAND_HMAC_OFFSET + HMAC_KEY_LEN].fill(0xC1);
        buf[OTP_NAND_KEY_OFFSET..OTP_NAND_KEY_OFFSET + AES_KEY_LEN].fill(0xC2);
        buf[OTP_JTAG_STATUS_OFFSET..].copy_from_slice(&0x0000_0002_u32.to_be_bytes());
        Otp::from_bytes(&buf).expect("patterned dump")
    }

    #[test]
    fn wrong_size_rejected() {
        assert!(Otp::from_bytes(&[0; OTP_SIZE - 1]).is_err());
        assert!(Otp::from_bytes(&[0; OTP_SIZE + 1]).is_err());
    }

    #[test]
    fn key_offsets() {
        let otp = patterned();
        assert_eq!(otp.wii_nand_hmac(), [0xA1; HMAC_KEY_LEN]);
        assert_eq!(otp.wii_nand_key(), [0xA2; AES_KEY_LEN]);
        assert_eq!(otp.fw_ancast_key(), [0xB1; AES_KEY_LEN]);
        assert_eq!(otp.seeprom_key(), [0xB2; AES_KEY_LEN]);
        assert_eq!(otp.nand_hmac(), [0xC1; HMAC_KEY_LEN]);
        assert_eq!(otp.nand_key(), [0xC2; AES_KEY_LEN]);
    }

    #[test]
    fn status_words() {
        let otp = patterned();
        assert_eq!(otp.security_level(), 0x9000_0000);
        assert_eq!(otp.jtag_status(), 2);
        assert!(otp.prsh_crypto_enabled());
    }

    #[test]
    fn version_selects_key_bank() {
        let otp = patterned();
        assert_eq!(otp.isfs_aes_key(0), otp.wii_nand_key());
        assert_eq!(otp.isfs_hmac_key(0), otp.wii_nand_hmac());
        assert_eq!(otp.isfs_aes_key(1), otp.nand_key());
        assert_eq!(otp.isfs_hmac_key(1), otp.nand_hmac());
    }

    #[test]
    fn defused_detection() {
        // Fully populated bank: not defused.
        let full = Otp::from_bytes(&[0x5A; OTP_SIZE]).expect("full dump");
        assert!(!full.is_defused());

        // Data only below the ancast key region, jtag word still set.
        let mut buf = vec![0_u8; OTP_SIZE];
        buf[..OTP_SECURITY_LEVEL_OFFSET + 4].fill(0x5A);
        buf[OTP_JTAG_STATUS_OFFSET..].copy_from_slice(&1_u32.to_be_bytes());
        let blanked = Otp::from_bytes(&buf).expect("blanked dump");
        assert!(blanked.is_defused());
    }
}
