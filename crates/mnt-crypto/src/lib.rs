//! Console secrets and integrity primitives.
//!
//! Everything key-shaped lives here: the OTP fuse-bank view that the rest of
//! the stack pulls AES and HMAC keys from, the SEEPROM board-config checks,
//! and thin wrappers over AES-128-CBC, HMAC-SHA1, SHA-1 and CRC32 so the
//! engine crates never touch cipher crates directly.
//!
//! The AES wrapper preserves the chunked-IV discipline of the hardware
//! engine it replaces: a caller can run one CBC stream across several
//! buffers by passing `keep_iv` on every chunk after the first.

#![forbid(unsafe_code)]

pub mod aes;
pub mod hash;
pub mod otp;
pub mod seeprom;

pub use aes::{
    decrypt_cbc, encrypt_cbc, AesCbc, AES_BLOCK_SIZE, AES_IV_LEN, AES_KEY_LEN, ANCAST_IV, PRSH_IV,
    ZERO_IV,
};
pub use hash::{crc32, hmac_sha1, sha1, Sha1Ctx, HMAC_KEY_LEN, SHA1_LEN};
pub use otp::{Otp, OTP_FW_ANCAST_KEY_OFFSET, OTP_SECURITY_LEVEL_OFFSET, OTP_SIZE};
