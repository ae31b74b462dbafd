//! The parse → load → verify → decrypt → entry pipeline.
//!
//! [`load_image`] probes a source, parses the ancast header, resolves the
//! load window from the target/device pair and stages the full image into
//! an [`Arena`] over that window. What happens next depends on the boot
//! stage and target: stage-2 loads verify the body SHA-1 against the header
//! and decrypt IOP bodies stored ciphered, while the boot1 chainload skips
//! both and trusts the next stage to re-check what it inherited. The entry
//! vector is the body start for PPC images and `body + header_size` of the
//! embedded IOS mini-header for IOP images.

use mnt_crypto::{decrypt_cbc, sha1, Otp, ANCAST_IV};
use mnt_error::{MinuteError, Result};
use mnt_ondisk::{AncastHeader, IosHeader};
use mnt_types::{
    MemRegion, ParseError, ANCAST_PPC_VWII, ANCAST_PPC_WIIU, ANCAST_TARGET_IOP, ANCAST_TARGET_PPC,
    REGION_IOP, REGION_PPC_VWII, REGION_PPC_WIIU,
};
use serde::Serialize;
use tracing::debug;

use crate::arena::Arena;
use crate::source::{ImageSource, ANCAST_PROBE_SIZE};

/// Which boot stage is driving the load.
///
/// The boot1 chainload runs before anything it could check against is
/// trusted; it skips body verification and decryption outright and leaves
/// both to the stage it jumps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootStage {
    Boot1,
    Stage2,
}

/// Load window for a header's target/device pair.
///
/// IOP images load at the IOP base whatever their device id; PPC images
/// split on device id 1 (Wii U) vs 3 (vWii). Anything else has no window
/// and is a hard error.
pub fn resolve_load_region(header: &AncastHeader) -> Result<MemRegion> {
    let device_id = u32::from(header.device_id());
    match (header.target(), device_id) {
        (ANCAST_TARGET_IOP, _) => Ok(REGION_IOP),
        (ANCAST_TARGET_PPC, ANCAST_PPC_WIIU) => Ok(REGION_PPC_WIIU),
        (ANCAST_TARGET_PPC, ANCAST_PPC_VWII) => Ok(REGION_PPC_VWII),
        _ => Err(ParseError::InvalidField {
            field: "device",
            reason: "no load window for this target/device pair",
        }
        .into()),
    }
}

/// Probe, parse and stage an image into its load window.
///
/// The staged image is not yet verified or decrypted; the front-ends
/// ([`load_iop`], [`load_ppc`]) drive those per stage and target.
pub fn load_image(source: &mut dyn ImageSource) -> Result<LoadedImage> {
    let mut probe = [0_u8; ANCAST_PROBE_SIZE];
    source.probe(&mut probe)?;
    let header = AncastHeader::parse(&probe)?;

    let region = resolve_load_region(&header)?;
    let total = header
        .total_size()
        .ok_or(ParseError::IntegerConversion { field: "body_size" })?;
    if total > region.len as usize {
        return Err(MinuteError::Format(format!(
            "image of {total:#x} bytes does not fit load window {:#010x}+{:#x}",
            region.base, region.len
        )));
    }

    let mut arena = Arena::new(region);
    source.load(total, arena.bytes_mut())?;
    debug!(
        source = source.describe(),
        base = region.base,
        total,
        "staged ancast image"
    );

    Ok(LoadedImage { header, arena })
}

/// An image staged into its load window, before trust decisions.
pub struct LoadedImage {
    header: AncastHeader,
    arena: Arena,
}

impl LoadedImage {
    #[must_use]
    pub fn header(&self) -> &AncastHeader {
        &self.header
    }

    #[must_use]
    pub fn load_region(&self) -> MemRegion {
        self.arena.region()
    }

    /// Absolute address of the body.
    #[must_use]
    pub fn body_addr(&self) -> u32 {
        self.arena.region().base + self.header.header_size() as u32
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        let start = self.header.header_size();
        &self.arena.bytes()[start..start + self.header.body_size as usize]
    }

    fn body_mut(&mut self) -> &mut [u8] {
        let start = self.header.header_size();
        &mut self.arena.bytes_mut()[start..start + self.header.body_size as usize]
    }

    /// Compare the body SHA-1 against the hash carried in the header.
    ///
    /// The hash covers the body as stored, so this runs before any
    /// decryption.
    pub fn verify(&self) -> Result<()> {
        let computed = sha1(self.body());
        if computed != self.header.body_hash {
            return Err(MinuteError::HashMismatch {
                expected: hex::encode(self.header.body_hash),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    /// Decrypt the body in place with the console firmware key.
    ///
    /// Only whole cipher blocks are turned over; a ragged tail shorter than
    /// one block stays as stored, exactly as the hardware engine leaves it.
    pub fn decrypt(&mut self, otp: &Otp) -> Result<()> {
        let key = otp.fw_ancast_key();
        let body = self.body_mut();
        let aligned = body.len() & !0xF;
        decrypt_cbc(&key, &ANCAST_IV, &mut body[..aligned])?;
        Ok(())
    }

    /// IOP entry vector: body start plus the embedded mini-header's size.
    pub fn iop_entry(&self) -> Result<u32> {
        let ios = IosHeader::parse(self.body())?;
        self.body_addr()
            .checked_add(ios.header_size)
            .ok_or_else(|| {
                ParseError::IntegerConversion {
                    field: "ios header_size",
                }
                .into()
            })
    }

    /// PPC entry vector: the body start itself.
    #[must_use]
    pub fn ppc_entry(&self) -> u32 {
        self.body_addr()
    }

    /// Summary of the staged image for reports and logs.
    #[must_use]
    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            sig_type: self.header.sig_type,
            target: self.header.target(),
            device_id: self.header.device_id(),
            version: self.header.version,
            body_size: self.header.body_size,
            plaintext: self.header.body_is_plaintext(),
            load_base: self.arena.region().base,
            body_addr: self.body_addr(),
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[must_use]
    pub fn into_arena(self) -> Arena {
        self.arena
    }
}

/// Staged-image summary.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub sig_type: u32,
    pub target: u8,
    pub device_id: u8,
    pub version: u32,
    pub body_size: u32,
    pub plaintext: bool,
    pub load_base: u32,
    pub body_addr: u32,
}

/// A fully processed image, ready to jump into.
pub struct BootImage {
    pub entry: u32,
    pub header: AncastHeader,
    arena: Arena,
}

impl BootImage {
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    #[must_use]
    pub fn into_arena(self) -> Arena {
        self.arena
    }
}

/// Load an IOP image: verify, decrypt a ciphered body, resolve the vector.
pub fn load_iop(source: &mut dyn ImageSource, otp: &Otp, stage: BootStage) -> Result<BootImage> {
    let mut image = load_image(source)?;
    if !image.header().is_iop() {
        return Err(ParseError::InvalidField {
            field: "device",
            reason: "not an IOP image",
        }
        .into());
    }

    if stage == BootStage::Stage2 {
        image.verify()?;
        if !image.header().body_is_plaintext() {
            debug!(source = source.describe(), "decrypting IOP body");
            image.decrypt(otp)?;
        }
    }

    let entry = image.iop_entry()?;
    debug!(entry, "IOP image ready");
    let LoadedImage { header, arena } = image;
    Ok(BootImage {
        entry,
        header,
        arena,
    })
}

/// Load a PPC image. PPC bodies are never decrypted by this stage; the
/// entry vector is the body itself.
pub fn load_ppc(source: &mut dyn ImageSource, stage: BootStage) -> Result<BootImage> {
    let image = load_image(source)?;
    if !image.header().is_ppc() {
        return Err(ParseError::InvalidField {
            field: "device",
            reason: "not a PPC image",
        }
        .into());
    }

    if stage == BootStage::Stage2 {
        image.verify()?;
    }

    let entry = image.ppc_entry();
    debug!(entry, "PPC image ready");
    let LoadedImage { header, arena } = image;
    Ok(BootImage {
        entry,
        header,
        arena,
    })
}


#[cfg(test)]
mod tests {
    use super::testutil::{build_image, ios_body, test_otp};
    use super::*;
    use crate::source::MemorySource;

    #[test]
    fn resolves_documented_load_windows() {
        let iop = build_image(0x21, 0x01, &ios_body(0x40, 0x20), false);
        let header = AncastHeader::parse(&iop).expect("parse");
        assert_eq!(resolve_load_region(&header).expect("iop"), REGION_IOP);

        let wiiu = build_image(0x11, 0x02, &[0_u8; 0x20], false);
        let header = AncastHeader::parse(&wiiu).expect("parse");
        assert_eq!(resolve_load_region(&header).expect("wiiu"), REGION_PPC_WIIU);

        let vwii = build_image(0x13, 0x02, &[0_u8; 0x20], false);
        let header = AncastHeader::parse(&vwii).expect("parse");
        assert_eq!(resolve_load_region(&header).expect("vwii"), REGION_PPC_VWII);
    }

    #[test]
    fn unknown_ppc_device_id_is_a_hard_error() {
        let image = build_image(0x12, 0x01, &[0_u8; 0x20], false);
        let mut source = MemorySource::new(&image);
        assert!(matches!(
            load_image(&mut source),
            Err(MinuteError::Parse(ParseError::InvalidField {
                field: "device",
                ..
            }))
        ));
    }

    #[test]
    fn stages_image_at_the_window_base() {
        let body = ios_body(0x100, 0x40);
        let image = build_image(0x21, 0x01, &body, false);
        let mut source = MemorySource::new(&image);

        let loaded = load_image(&mut source).expect("load");
        assert_eq!(loaded.load_region(), REGION_IOP);
        assert_eq!(loaded.body_addr(), REGION_IOP.base + 0x100);
        assert_eq!(loaded.body(), &body[..]);
        assert_eq!(&loaded.arena().bytes()[..image.len()], &image[..]);
        loaded.verify().expect("verify");
    }

    #[test]
    fn corrupting_any_body_byte_fails_verify() {
        let image = build_image(0x21, 0x01, &ios_body(0x80, 0x20), false);
        for tamper in [0, 0x3F, 0x7F] {
            let mut broken = image.clone();
            let body_start = broken.len() - 0x80;
            broken[body_start + tamper] ^= 0x01;
            let mut source = MemorySource::new(&broken);
            let loaded = load_image(&mut source).expect("load");
            assert!(matches!(
                loaded.verify(),
                Err(MinuteError::HashMismatch { .. })
            ));
        }
    }

    #[test]
    fn iop_load_decrypts_ciphered_bodies() {
        let body = ios_body(0x80, 0x30);
        let image = build_image(0x21, 0x01, &body, true);
        let mut source = MemorySource::new(&image);

        let otp = test_otp();
        let boot = load_iop(&mut source, &otp, BootStage::Stage2).expect("load");
        // The embedded IOS header is only legible after decryption.
        assert_eq!(boot.entry, REGION_IOP.base + 0x100 + 0x30);
        let body_off = 0x100;
        assert_eq!(
            &boot.arena().bytes()[body_off..body_off + body.len()],
            &body[..]
        );
    }

    #[test]
    fn plaintext_bodies_are_left_alone() {
        let body = ios_body(0x80, 0x10);
        let image = build_image(0x21, 0x01, &body, false);
        let mut source = MemorySource::new(&image);

        let boot = load_iop(&mut source, &test_otp(), BootStage::Stage2).expect("load");
        assert_eq!(boot.entry, REGION_IOP.base + 0x100 + 0x10);
        assert_eq!(
            &boot.arena().bytes()[0x100..0x100 + body.len()],
            &body[..]
        );
    }

    #[test]
    fn boot1_stage_skips_verify_and_decrypt() {
        let body = ios_body(0x80, 0x20);
        let mut image = build_image(0x21, 0x01, &body, false);
        // Break the stored hash; a stage-2 load must refuse, boot1 must not.
        let len = image.len();
        image[len - 1] ^= 0xFF;

        let mut source = MemorySource::new(&image);
        assert!(load_iop(&mut source, &test_otp(), BootStage::Stage2).is_err());

        let mut source = MemorySource::new(&image);
        let boot = load_iop(&mut source, &test_otp(), BootStage::Boot1).expect("boot1 load");
        assert_eq!(boot.entry, REGION_IOP.base + 0x100 + 0x20);
    }

    #[test]
    fn ppc_load_never_decrypts() {
        let body = vec![0x5A_u8; 0x40];
        let image = build_image(0x11, 0x02, &body, false);
        let mut source = MemorySource::new(&image);

        let boot = load_ppc(&mut source, BootStage::Stage2).expect("load");
        assert_eq!(boot.entry, REGION_PPC_WIIU.base + 0x200);
        assert_eq!(boot.header.target(), ANCAST_TARGET_PPC);
        assert_eq!(
            &boot.arena().bytes()[0x200..0x200 + body.len()],
            &body[..]
        );
    }

    #[test]
    fn front_ends_enforce_the_target() {
        let iop_image = build_image(0x21, 0x01, &ios_body(0x40, 0), false);
        let mut source = MemorySource::new(&iop_image);
        assert!(load_ppc(&mut source, BootStage::Stage2).is_err());

        let ppc_image = build_image(0x11, 0x01, &[0_u8; 0x40], false);
        let mut source = MemorySource::new(&ppc_image);
        assert!(load_iop(&mut source, &test_otp(), BootStage::Stage2).is_err());
    }

    #[test]
    fn info_summarizes_the_staged_image() {
        let image = build_image(0x21, 0x01, &ios_body(0x40, 0), false);
        let mut source = MemorySource::new(&image);
        let loaded = load_image(&mut source).expect("load");

        let info = loaded.info();
        assert_eq!(info.target, ANCAST_TARGET_IOP);
        assert_eq!(info.device_id, 1);
        assert_eq!(info.load_base, 0x0100_0000);
        assert_eq!(info.body_addr, 0x0100_0100);
        assert!(info.plaintext);
        assert_eq!(info.body_size, 0x40);
    }
}
