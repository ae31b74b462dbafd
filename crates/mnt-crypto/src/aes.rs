//! AES-128-CBC with the chunked-IV discipline of the original engine.
//!
//! The flash pipeline ciphers a 0x4000-byte cluster as one CBC stream but
//! feeds it to the engine one 0x800-byte page at a time; each chunk after
//! the first continues the chain from the previous ciphertext block. The
//! [`AesCbc`] context models exactly that: `keep_iv = false` starts a fresh
//! stream from the configured IV, `keep_iv = true` continues the running
//! one.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use mnt_types::ParseError;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const AES_BLOCK_SIZE: usize = 0x10;
pub const AES_KEY_LEN: usize = 0x10;
pub const AES_IV_LEN: usize = 0x10;

/// All-zero IV, the default for NAND cluster streams and SEEPROM blocks.
pub const ZERO_IV: [u8; AES_IV_LEN] = [0; AES_IV_LEN];

/// Fixed IV for ancast firmware bodies.
pub const ANCAST_IV: [u8; AES_IV_LEN] = [
    0x91, 0xC9, 0xD0, 0x08, 0x31, 0x28, 0x51, 0xEF, 0x6B, 0x22, 0x8B, 0xF1, 0x4B, 0xAD, 0x43,
    0x22,
];

/// Fixed IV for the persistent-store region.
pub const PRSH_IV: [u8; AES_IV_LEN] = [
    0x0A, 0xAB, 0xA5, 0x30, 0x2E, 0x90, 0x12, 0xD9, 0x08, 0x51, 0x74, 0xE8, 0x6B, 0x83, 0xEC,
    0x22,
];

fn check_block_aligned(buf: &[u8]) -> Result<(), ParseError> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(ParseError::InvalidField {
            field: "aes buffer",
            reason: "length is not a multiple of the cipher block size",
        });
    }
    Ok(())
}

/// A keyed CBC context carrying both a configured IV and the running chain
/// state of the last operation.
#[derive(Clone)]
pub struct AesCbc {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
    chain: [u8; AES_IV_LEN],
}

impl AesCbc {
    /// Context with an all-zero IV.
    #[must_use]
    pub fn new(key: [u8; AES_KEY_LEN]) -> Self {
        Self::with_iv(key, ZERO_IV)
    }

    #[must_use]
    pub fn with_iv(key: [u8; AES_KEY_LEN], iv: [u8; AES_IV_LEN]) -> Self {
        Self {
            key,
            iv,
            chain: iv,
        }
    }

    /// Replace the configured IV used when `keep_iv` is false.
    pub fn set_iv(&mut self, iv: [u8; AES_IV_LEN]) {
        self.iv = iv;
    }

    /// Reset the configured IV to all zeros.
    pub fn reset_iv(&mut self) {
        self.iv = ZERO_IV;
    }

    fn start_iv(&self, keep_iv: bool) -> [u8; AES_IV_LEN] {
        if keep_iv {
            self.chain
        } else {
            self.iv
        }
    }

    /// Encrypt `buf` in place. Length must be a multiple of the block size;
    /// an empty buffer is a no-op.
    pub fn encrypt(&mut self, buf: &mut [u8], keep_iv: bool) -> Result<(), ParseError> {
        check_block_aligned(buf)?;
        if buf.is_empty() {
            return Ok(());
        }
        let iv = self.start_iv(keep_iv);
        let mut enc = Aes128CbcEnc::new(&self.key.into(), &iv.into());
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.chain.copy_from_slice(&buf[buf.len() - AES_BLOCK_SIZE..]);
        Ok(())
    }

    /// Decrypt `buf` in place. Length must be a multiple of the block size;
    /// an empty buffer is a no-op.
    pub fn decrypt(&mut self, buf: &mut [u8], keep_iv: bool) -> Result<(), ParseError> {
        check_block_aligned(buf)?;
        if buf.is_empty() {
            return Ok(());
        }
        let iv = self.start_iv(keep_iv);
        // The chain continues from the ciphertext, so grab it before the
        // in-place decrypt overwrites it.
        let mut next_chain = [0_u8; AES_IV_LEN];
        next_chain.copy_from_slice(&buf[buf.len() - AES_BLOCK_SIZE..]);
        let mut dec = Aes128CbcDec::new(&self.key.into(), &iv.into());
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.chain = next_chain;
        Ok(())
    }
}

/// One-shot CBC encrypt of a whole buffer.
pub fn encrypt_cbc(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; AES_IV_LEN],
    buf: &mut [u8],
) -> Result<(), ParseError> {
    AesCbc::with_iv(*key, *iv).encrypt(buf, false)
}

/// One-shot CBC decrypt of a whole buffer.
pub fn decrypt_cbc(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; AES_IV_LEN],
    buf: &mut [u8],
) -> Result<(), ParseError> {
    AesCbc::with_iv(*key, *iv).decrypt(buf, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A F.2 (CBC-AES128) vectors.
    const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const IV: &str = "000102030405060708090a0b0c0d0e0f";
    const PLAIN: &str = "6bc1bee22e409f96e93d7e117393172a\
                         ae2d8a571e03ac9c9eb76fac45af8e51\
                         30c81c46a35ce411e5fbc1191a0a52ef\
                         f69f2445df4f9b17ad2b417be66c3710";
    const CIPHER: &str = "7649abac8119b246cee98e9b12e9197d\
                          5086cb9b507219ee95db113a917678b2\
                          73bed6b8e3c1743b7116e69e22229516\
                          3ff1caa1681fac09120eca307586e1a7";

    fn key() -> [u8; AES_KEY_LEN] {
        let bytes = hex::decode(KEY).expect("key hex");
        bytes.try_into().expect("key len")
    }

    fn iv() -> [u8; AES_IV_LEN] {
        let bytes = hex::decode(IV).expect("iv hex");
        bytes.try_into().expect("iv len")
    }

    #[test]
    fn known_answer_one_shot() {
        let mut buf = hex::decode(PLAIN).expect("plaintext hex");
        encrypt_cbc(&key(), &iv(), &mut buf).expect("encrypt");
        assert_eq!(hex::encode(&buf), CIPHER);

        decrypt_cbc(&key(), &iv(), &mut buf).expect("decrypt");
        assert_eq!(hex::encode(&buf), PLAIN);
    }

    #[test]
    fn chunked_stream_matches_one_shot() {
        let mut whole = hex::decode(PLAIN).expect("plaintext hex");
        let mut chunked = whole.clone();

        encrypt_cbc(&key(), &iv(), &mut whole).expect("one-shot");

        let mut ctx = AesCbc::with_iv(key(), iv());
        for (i, chunk) in chunked.chunks_mut(AES_BLOCK_SIZE).enumerate() {
            ctx.encrypt(chunk, i > 0).expect("chunk encrypt");
        }
        assert_eq!(chunked, whole);

        // Decrypt side carries the chain the same way.
        let mut ctx = AesCbc::with_iv(key(), iv());
        for (i, chunk) in chunked.chunks_mut(2 * AES_BLOCK_SIZE).enumerate() {
            ctx.decrypt(chunk, i > 0).expect("chunk decrypt");
        }
        assert_eq!(hex::encode(&chunked), PLAIN);
    }

    #[test]
    fn fresh_iv_restarts_the_stream() {
        let mut first = [0x41_u8; AES_BLOCK_SIZE];
        let mut second = [0x41_u8; AES_BLOCK_SIZE];

        let mut ctx = AesCbc::new(key());
        ctx.encrypt(&mut first, false).expect("first");
        ctx.encrypt(&mut second, false).expect("second");
        // Same plaintext, same starting IV: identical ciphertext.
        assert_eq!(first, second);

        let mut chained = [0x41_u8; AES_BLOCK_SIZE];
        ctx.encrypt(&mut chained, true).expect("chained");
        assert_ne!(chained, first);
    }

    #[test]
    fn misaligned_length_rejected() {
        let mut buf = [0_u8; AES_BLOCK_SIZE + 1];
        assert!(AesCbc::new(key()).encrypt(&mut buf, false).is_err());
        assert!(AesCbc::new(key()).decrypt(&mut buf, false).is_err());
    }

    #[test]
    fn empty_buffer_is_a_no_op() {
        let mut ctx = AesCbc::with_iv(key(), iv());
        ctx.encrypt(&mut [], false).expect("empty encrypt");

        // The chain state is untouched: it still holds the configured IV,
        // so a keep_iv chunk after the no-op continues that stream.
        let mut via_empty = hex::decode(PLAIN).expect("plaintext hex");
        let mut direct = via_empty.clone();
        ctx.encrypt(&mut via_empty, true).expect("encrypt");
        encrypt_cbc(&key(), &iv(), &mut direct).expect("one-shot");
        assert_eq!(via_empty, direct);
    }
}
