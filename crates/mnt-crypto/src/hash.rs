//! Digest and checksum primitives: SHA-1, HMAC-SHA1 and CRC32.

use hmac::{Hmac, Mac};
use mnt_types::HMAC_LEN;
use sha1::{Digest, Sha1};

/// SHA-1 digest length.
pub const SHA1_LEN: usize = 0x14;

/// NAND HMAC keys are 20 bytes.
pub const HMAC_KEY_LEN: usize = 0x14;

/// IEEE CRC32 of a buffer.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// SHA-1 of a buffer.
#[must_use]
pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut out = [0_u8; SHA1_LEN];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// Streaming SHA-1 for chunked image loads.
#[derive(Clone, Default)]
pub struct Sha1Ctx {
    inner: Sha1,
}

impl Sha1Ctx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[must_use]
    pub fn finalize(self) -> [u8; SHA1_LEN] {
        let mut out = [0_u8; SHA1_LEN];
        out.copy_from_slice(&self.inner.finalize());
        out
    }
}

/// HMAC-SHA1 over the concatenation of `parts`.
///
/// The flash integrity path signs a seed block followed by cluster data;
/// taking parts avoids assembling that concatenation in a scratch buffer.
#[must_use]
pub fn hmac_sha1(key: &[u8; HMAC_KEY_LEN], parts: &[&[u8]]) -> [u8; HMAC_LEN] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0_u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}
