//! Hamming-style ECC over 512-byte subblocks.
//!
//! Each 2048-byte page splits into four subblocks and each subblock gets a
//! 4-byte code stored in the spare area at [`SPARE_ECC_OFFSET`]. The code is
//! a line-parity construction: twelve parity pairs, one per address bit of a
//! bit within the subblock (3 bits of position-in-byte, 9 bits of byte
//! address). The "even" word collects the parities of the halves where the
//! address bit is 0, the "odd" word the halves where it is 1.
//!
//! A single flipped data bit therefore produces an even/odd syndrome pair
//! whose XOR is 0xfff and whose odd half is exactly the flipped bit's
//! address. A flipped bit inside the stored code itself shows up as a
//! syndrome with a single set bit.

use mnt_types::{ECC_BYTES, ECC_SUBBLOCK_SIZE, PAGE_SIZE, PAGE_SPARE_SIZE, SPARE_ECC_OFFSET};
use serde::{Deserialize, Serialize};

/// Outcome of ECC processing for one page (or a span of pages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EccStatus {
    /// Data matched its code, or the flash is unformatted.
    Clean,
    /// At least one bit error was repaired (or sat in the code field itself).
    Corrected,
    /// At least one subblock had more errors than the code can locate.
    Uncorrectable,
}

impl EccStatus {
    /// Merge two outcomes; the worse one wins.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Uncorrectable, _) | (_, Self::Uncorrectable) => Self::Uncorrectable,
            (Self::Corrected, _) | (_, Self::Corrected) => Self::Corrected,
            (Self::Clean, Self::Clean) => Self::Clean,
        }
    }

    /// True unless the data is known bad.
    #[must_use]
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Uncorrectable)
    }
}

fn parity(x: u8) -> u8 {
    (x.count_ones() & 1) as u8
}

fn calc_raw(sub: &[u8]) -> [u8; 4] {
    let mut a = [[0_u8; 2]; 12];

    for (i, &x) in sub.iter().enumerate() {
        for j in 0..9 {
            a[3 + j][(i >> j) & 1] ^= x;
        }
    }

    // Rows 0..3 split the whole-block byte parity by bit position.
    let x = a[3][0] ^ a[3][1];
    a[0][0] = x & 0x55;
    a[0][1] = x & 0xAA;
    a[1][0] = x & 0x33;
    a[1][1] = x & 0xCC;
    a[2][0] = x & 0x0F;
    a[2][1] = x & 0xF0;

    let mut even: u16 = 0;
    let mut odd: u16 = 0;
    for (j, row) in a.iter().enumerate() {
        even |= u16::from(parity(row[0])) << j;
        odd |= u16::from(parity(row[1])) << j;
    }

    [
        (even & 0xFF) as u8,
        (even >> 8) as u8,
        (odd & 0xFF) as u8,
        (odd >> 8) as u8,
    ]
}

/// Compute the 4-byte code for one 512-byte subblock.
#[must_use]
pub fn calc_subblock_ecc(sub: &[u8]) -> [u8; 4] {
    debug_assert_eq!(sub.len(), ECC_SUBBLOCK_SIZE);
    calc_raw(sub)
}

/// Apply the controller's program-path spare treatment in place.
///
/// Byte 0 is forced to 0xFF and the stored ECC field is recomputed from
/// `data`, regardless of what the caller staged there. All other spare
/// bytes (the HMAC copy area among them) are left alone.
pub fn finalize_spare(data: &[u8], spare: &mut [u8]) {
    debug_assert_eq!(data.len(), PAGE_SIZE);
    debug_assert_eq!(spare.len(), PAGE_SPARE_SIZE);
    spare[0] = 0xFF;
    let slots = &mut spare[SPARE_ECC_OFFSET..SPARE_ECC_OFFSET + ECC_BYTES];
    for (sub, slot) in data
        .chunks_exact(ECC_SUBBLOCK_SIZE)
        .zip(slots.chunks_exact_mut(4))
    {
        slot.copy_from_slice(&calc_raw(sub));
    }
}

/// Build a fresh spare area for `data`: zeros, then the program-path
/// treatment (marker byte plus computed code).
#[must_use]
pub fn blank_spare(data: &[u8]) -> [u8; PAGE_SPARE_SIZE] {
    let mut spare = [0_u8; PAGE_SPARE_SIZE];
    finalize_spare(data, &mut spare);
    spare
}

/// Check one page against its stored code, repairing single-bit errors in
/// `data` in place.
///
/// Subblocks whose stored code is all-ones (unformatted flash) or whose
/// syndrome is zero are skipped. The per-page outcome is the merge of the
/// subblock outcomes.
#[must_use]
pub fn correct_page(data: &mut [u8], spare: &[u8]) -> EccStatus {
    debug_assert_eq!(data.len(), PAGE_SIZE);
    debug_assert_eq!(spare.len(), PAGE_SPARE_SIZE);

    let mut corrected = 0_u32;
    let mut uncorrectable = 0_u32;
    let stored_codes = &spare[SPARE_ECC_OFFSET..SPARE_ECC_OFFSET + ECC_BYTES];

    for (sub, stored) in data
        .chunks_exact_mut(ECC_SUBBLOCK_SIZE)
        .zip(stored_codes.chunks_exact(4))
    {
        if stored == [0xFF; 4] {
            continue;
        }
        let calc = calc_raw(sub);
        let syndrome = [
            stored[0] ^ calc[0],
            stored[1] ^ calc[1],
            stored[2] ^ calc[2],
            stored[3] ^ calc[3],
        ];
        if syndrome == [0; 4] {
            continue;
        }

        // A single set bit means the error sits in the stored code itself.
        let set_bits: u32 = syndrome.iter().map(|b| b.count_ones()).sum();
        if set_bits == 1 {
            corrected += 1;
            continue;
        }

        let even = u16::from(syndrome[0]) | (u16::from(syndrome[1] & 0x0F) << 8);
        let odd = u16::from(syndrome[2]) | (u16::from(syndrome[3] & 0x0F) << 8);
        if even ^ odd != 0xFFF {
            uncorrectable += 1;
            continue;
        }
        sub[usize::from(odd >> 3)] ^= 1 << (odd & 7);
        corrected += 1;
    }

    if uncorrectable > 0 {
        EccStatus::Uncorrectable
    } else if corrected > 0 {
        EccStatus::Corrected
    } else {
        EccStatus::Clean
    }
}
