//! SEEPROM integrity checks and parameter-block crypto.
//!
//! The board config carries two independent CRCs (production timestamp and
//! the bc block) plus fixed markers; a failed bc check falls back to the
//! documented default config. The three 16-byte parameter blocks are AES
//! encrypted as single blocks with a zero IV, each carrying its own CRC32
//! inside the ciphertext.

use mnt_error::{MinuteError, Result};
use mnt_ondisk::seeprom::{
    BoardConfig, Boot1Params, ParamSlot, Seeprom, SEEPROM_BC_SIZE, SEEPROM_MARKER_AA55,
    SEEPROM_MARKER_BB66, SEEPROM_PARAM_BLOCK_SIZE, SEEPROM_PARAM_DATA_SIZE,
};
use mnt_types::read_be_u32;

use crate::aes::{decrypt_cbc, encrypt_cbc, ZERO_IV};
use crate::hash::crc32;
use crate::otp::Otp;

/// Whether the stored board config passes all of its checks: both markers,
/// the timestamp CRC, the bc size field and the bc CRC.
pub fn verify(seeprom: &Seeprom) -> Result<bool> {
    let bc = seeprom.board_config()?;
    Ok(seeprom.marker_aa55()? == SEEPROM_MARKER_AA55
        && seeprom.marker_bb66()? == SEEPROM_MARKER_BB66
        && crc32(seeprom.timestamp_crc_input()) == seeprom.stored_timestamp_crc()?
        && bc.size == SEEPROM_BC_SIZE
        && crc32(seeprom.bc_crc_input()) == bc.crc)
}

/// Board config to use, substituting the default when the stored one fails
/// verification. The substitute is written back into the image so later
/// reads agree.
pub fn load_board_config(seeprom: &mut Seeprom) -> Result<BoardConfig> {
    if !verify(seeprom)? {
        seeprom.install_default_bc()?;
    }
    Ok(seeprom.board_config()?)
}

fn check_param_crc(block: &[u8; SEEPROM_PARAM_BLOCK_SIZE]) -> Result<()> {
    let stored = read_be_u32(block, SEEPROM_PARAM_DATA_SIZE)?;
    let computed = crc32(&block[..SEEPROM_PARAM_DATA_SIZE]);
    if stored != computed {
        return Err(MinuteError::HashMismatch {
            expected: format!("{stored:08x}"),
            computed: format!("{computed:08x}"),
        });
    }
    Ok(())
}

/// Build a plaintext parameter block: 0xC data bytes plus their CRC32.
#[must_use]
pub fn make_param_block(
    data: &[u8; SEEPROM_PARAM_DATA_SIZE],
) -> [u8; SEEPROM_PARAM_BLOCK_SIZE] {
    let mut block = [0_u8; SEEPROM_PARAM_BLOCK_SIZE];
    block[..SEEPROM_PARAM_DATA_SIZE].copy_from_slice(data);
    block[SEEPROM_PARAM_DATA_SIZE..].copy_from_slice(&crc32(data).to_be_bytes());
    block
}

/// Decrypt one parameter slot and return its data after the CRC check.
pub fn decrypt_param_block(
    otp: &Otp,
    seeprom: &Seeprom,
    slot: ParamSlot,
) -> Result<[u8; SEEPROM_PARAM_DATA_SIZE]> {
    let mut block = seeprom.param_block(slot)?;
    decrypt_cbc(&otp.seeprom_key(), &ZERO_IV, &mut block)?;
    check_param_crc(&block)?;
    let mut data = [0_u8; SEEPROM_PARAM_DATA_SIZE];
    data.copy_from_slice(&block[..SEEPROM_PARAM_DATA_SIZE]);
    Ok(data)
}

/// Encrypt a plaintext parameter block into a slot.
///
/// The plaintext CRC is checked before sealing, and the sealed block is
/// decrypted again and re-checked before it lands in the image.
pub fn encrypt_param_block(
    otp: &Otp,
    seeprom: &mut Seeprom,
    slot: ParamSlot,
    block: &[u8; SEEPROM_PARAM_BLOCK_SIZE],
) -> Result<()> {
    check_param_crc(block)?;

    let mut sealed = *block;
    encrypt_cbc(&otp.seeprom_key(), &ZERO_IV, &mut sealed)?;

    let mut readback = sealed;
    decrypt_cbc(&otp.seeprom_key(), &ZERO_IV, &mut readback)?;
    check_param_crc(&readback)?;

    seeprom.set_param_block(slot, &sealed)?;
    Ok(())
}

/// Decrypt a boot1 parameter slot into its typed form.
pub fn read_boot1_params(otp: &Otp, seeprom: &Seeprom, slot: ParamSlot) -> Result<Boot1Params> {
    let data = decrypt_param_block(otp, seeprom, slot)?;
    Ok(Boot1Params::parse(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnt_ondisk::seeprom::{
        BC_DEFAULT_PAYLOAD, SEEPROM_BC_CRC_OFFSET, SEEPROM_MARKER_AA55_OFFSET,
        SEEPROM_MARKER_BB66_OFFSET, SEEPROM_SIZE, SEEPROM_TIMESTAMP_CRC_OFFSET,
        SEEPROM_TIMESTAMP_OFFSET,
    };
    use crate::otp::OTP_SIZE;

    fn test_otp() -> Otp {
        let mut buf = vec![0_u8; OTP_SIZE];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        Otp::from_bytes(&buf).expect("otp")
    }

    fn consistent_seeprom() -> Seeprom {
        let mut seeprom = Seeprom::from_bytes(vec![0_u8; SEEPROM_SIZE]).expect("blank");
        {
            let bytes = seeprom.as_bytes_mut();
            bytes[SEEPROM_MARKER_AA55_OFFSET..SEEPROM_MARKER_AA55_OFFSET + 2]
                .copy_from_slice(&SEEPROM_MARKER_AA55.to_be_bytes());
            bytes[SEEPROM_MARKER_BB66_OFFSET..SEEPROM_MARKER_BB66_OFFSET + 2]
                .copy_from_slice(&SEEPROM_MARKER_BB66.to_be_bytes());
            bytes[SEEPROM_TIMESTAMP_OFFSET..SEEPROM_TIMESTAMP_OFFSET + 4]
                .copy_from_slice(&0x5397_1DA0_u32.to_be_bytes());
        }
        let timestamp_crc = crc32(seeprom.timestamp_crc_input());
        seeprom.as_bytes_mut()[SEEPROM_TIMESTAMP_CRC_OFFSET..SEEPROM_TIMESTAMP_CRC_OFFSET + 4]
            .copy_from_slice(&timestamp_crc.to_be_bytes());

        seeprom.install_default_bc().expect("default bc");
        let bc_crc = crc32(seeprom.bc_crc_input());
        seeprom.as_bytes_mut()[SEEPROM_BC_CRC_OFFSET..SEEPROM_BC_CRC_OFFSET + 4]
            .copy_from_slice(&bc_crc.to_be_bytes());
        seeprom
    }

    #[test]
    fn verify_accepts_consistent_image() {
        let seeprom = consistent_seeprom();
        assert!(verify(&seeprom).expect("verify"));
    }

    #[test]
    fn verify_rejects_each_broken_field() {
        for offset in [
            SEEPROM_MARKER_AA55_OFFSET,
            SEEPROM_MARKER_BB66_OFFSET,
            SEEPROM_TIMESTAMP_OFFSET,
            SEEPROM_BC_CRC_OFFSET,
        ] {
            let mut seeprom = consistent_seeprom();
            seeprom.as_bytes_mut()[offset] ^= 0xFF;
            assert!(!verify(&seeprom).expect("verify"), "offset {offset:#x}");
        }
    }

    #[test]
    fn failed_bc_falls_back_to_default() {
        let mut seeprom = consistent_seeprom();
        // Corrupt one payload byte; the stored CRC no longer matches.
        seeprom.as_bytes_mut()[SEEPROM_BC_CRC_OFFSET + 8] ^= 0x80;
        assert!(!verify(&seeprom).expect("verify"));

        let bc = load_board_config(&mut seeprom).expect("load");
        assert_eq!(bc.size, SEEPROM_BC_SIZE);
        assert_eq!(bc.payload, BC_DEFAULT_PAYLOAD);
    }

    #[test]
    fn intact_bc_is_left_alone() {
        let mut seeprom = consistent_seeprom();
        let mut tweaked = BC_DEFAULT_PAYLOAD;
        tweaked[6] = 0x77;
        // Payload starts 6 bytes past the crc word.
        seeprom.as_bytes_mut()[SEEPROM_BC_CRC_OFFSET + 6 + 6] = 0x77;
        let bc_crc = crc32(seeprom.bc_crc_input());
        seeprom.as_bytes_mut()[SEEPROM_BC_CRC_OFFSET..SEEPROM_BC_CRC_OFFSET + 4]
            .copy_from_slice(&bc_crc.to_be_bytes());

        let bc = load_board_config(&mut seeprom).expect("load");
        assert_eq!(bc.payload, tweaked);
    }

    #[test]
    fn param_block_round_trip() {
        let otp = test_otp();
        let mut seeprom = consistent_seeprom();
        let data = [0x5A_u8; SEEPROM_PARAM_DATA_SIZE];
        let block = make_param_block(&data);

        encrypt_param_block(&otp, &mut seeprom, ParamSlot::Boot1Params, &block)
            .expect("encrypt");
        // Stored form is ciphertext.
        assert_ne!(
            seeprom.param_block(ParamSlot::Boot1Params).expect("raw"),
            block
        );

        let out = decrypt_param_block(&otp, &seeprom, ParamSlot::Boot1Params).expect("decrypt");
        assert_eq!(out, data);
    }

    #[test]
    fn tampered_param_block_fails_crc() {
        let otp = test_otp();
        let mut seeprom = consistent_seeprom();
        let block = make_param_block(&[0x33; SEEPROM_PARAM_DATA_SIZE]);
        encrypt_param_block(&otp, &mut seeprom, ParamSlot::HwParams, &block).expect("encrypt");

        let mut raw = seeprom.param_block(ParamSlot::HwParams).expect("raw");
        raw[3] ^= 0x01;
        seeprom.set_param_block(ParamSlot::HwParams, &raw).expect("tamper");

        let err = decrypt_param_block(&otp, &seeprom, ParamSlot::HwParams)
            .expect_err("tampered block must fail");
        assert!(matches!(err, MinuteError::HashMismatch { .. }));
    }

    #[test]
    fn plaintext_crc_checked_before_sealing() {
        let otp = test_otp();
        let mut seeprom = consistent_seeprom();
        let mut block = make_param_block(&[0x44; SEEPROM_PARAM_DATA_SIZE]);
        block[SEEPROM_PARAM_DATA_SIZE] ^= 0xFF;

        assert!(
            encrypt_param_block(&otp, &mut seeprom, ParamSlot::Boot1Copy, &block).is_err()
        );
        // Nothing was written.
        assert_eq!(
            seeprom.param_block(ParamSlot::Boot1Copy).expect("slot"),
            [0; SEEPROM_PARAM_BLOCK_SIZE]
        );
    }

    #[test]
    fn boot1_params_decode() {
        let otp = test_otp();
        let mut seeprom = consistent_seeprom();
        let mut data = [0_u8; SEEPROM_PARAM_DATA_SIZE];
        data[..4].copy_from_slice(&[0x21, 0x21, 0x01, 0xF0]);
        let block = make_param_block(&data);
        encrypt_param_block(&otp, &mut seeprom, ParamSlot::Boot1Params, &block)
            .expect("encrypt");

        let params =
            read_boot1_params(&otp, &seeprom, ParamSlot::Boot1Params).expect("boot1 params");
        assert_eq!(params.version, 0x2121);
        assert_eq!(params.sector, 0x01F0);
    }
}
