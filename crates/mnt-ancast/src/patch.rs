//! elfldr patching: redirect the IOS loader's jumpout through a stub.
//!
//! The exploited IOS loader ends by jumping to the literal 0xFFFF0000 it
//! keeps near its entry. The patch flow loads the IOS image normally, finds
//! that literal within the first 0x1000 bytes of the entry vector, and
//! rewrites it to point into the scratch window, where a stub has been
//! staged: either the payload of a "SALTPTCH" blob or, with no blob at
//! hand, a two-word trampoline that jumps straight back to the original
//! target. Plugin blobs handed along are laid out below the ramdisk top for
//! the patched kernel to walk.

use mnt_crypto::{sha1, Otp};
use mnt_error::{MinuteError, Result};
use mnt_types::{
    ParseError, ANCAST_MAGIC_JUMPOUT, REGION_SCRATCH, SALTPTCH_MAGIC, SALTPTCH_VERSION,
};
use tracing::{debug, warn};

use crate::arena::Arena;
use crate::loader::{load_iop, BootImage, BootStage};
use crate::plugins::PluginChain;
use crate::source::ImageSource;

/// Blob header: 8-byte magic plus a version word.
pub const SALTPTCH_HEADER_SIZE: usize = 0xC;

/// Bytes scanned past the entry vector for the jumpout literal.
const JUMPOUT_SCAN_WINDOW: u32 = 0x1000;

/// SHA-1 of the first 0x200 bytes of the 5.5.0 IOS image the shipped patch
/// set was built against. A mismatch is advisory only.
const IOS_550_HEADER_SHA1: [u8; 20] = [
    0x12, 0x2D, 0x17, 0x82, 0x32, 0x5C, 0x73, 0x0F, 0x0A, 0x5D, 0x25, 0xEA, 0xE4, 0x91, 0xFA,
    0xB4, 0xEC, 0xF2, 0x90, 0x37,
];

/// Code staged into the scratch window for the redirected jumpout.
pub struct PatchStub {
    bytes: Vec<u8>,
}

impl PatchStub {
    /// Fallback stub: `ldr pc, [pc, #-4]` followed by the original jumpout
    /// target, so a patchless load behaves exactly like an unpatched one.
    #[must_use]
    pub fn builtin() -> Self {
        let mut bytes = vec![0xE5, 0x1F, 0xF0, 0x04];
        bytes.extend_from_slice(&ANCAST_MAGIC_JUMPOUT.to_be_bytes());
        Self { bytes }
    }

    /// Validate a "SALTPTCH" blob and take its payload as the stub.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() < SALTPTCH_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SALTPTCH_HEADER_SIZE,
                offset: 0,
                actual: blob.len(),
            }
            .into());
        }
        if blob[..8] != SALTPTCH_MAGIC {
            let mut actual = [0_u8; 8];
            actual.copy_from_slice(&blob[..8]);
            return Err(ParseError::InvalidMagic {
                expected: u64::from_be_bytes(SALTPTCH_MAGIC),
                actual: u64::from_be_bytes(actual),
            }
            .into());
        }
        let version = u32::from_be_bytes([blob[8], blob[9], blob[10], blob[11]]);
        if version != SALTPTCH_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported patch blob version",
            }
            .into());
        }
        let payload = &blob[SALTPTCH_HEADER_SIZE..];
        if payload.is_empty() {
            return Err(ParseError::InvalidField {
                field: "payload",
                reason: "patch blob carries no code",
            }
            .into());
        }
        Ok(Self {
            bytes: payload.to_vec(),
        })
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes
    }
}

/// A patched IOP load: the image with its jumpout redirected, the scratch
/// window holding the stub, and the plugin carveout when blobs were given.
pub struct PatchedImage {
    pub image: BootImage,
    pub scratch: Arena,
    pub plugins: Option<Arena>,
    /// Address of the rewritten jumpout literal.
    pub hook_addr: u32,
}

/// Load an IOP image and hook its loader's jumpout into `stub`.
///
/// The image goes through the full stage-2 pipeline first. Failing to find
/// the jumpout literal is a hard error: an unhooked loader would boot the
/// stock path with the patches silently dropped.
pub fn load_patched(
    source: &mut dyn ImageSource,
    otp: &Otp,
    stub: &PatchStub,
    plugins: &[&[u8]],
) -> Result<PatchedImage> {
    let mut image = load_iop(source, otp, BootStage::Stage2)?;

    let probe = sha1(&image.arena().bytes()[..0x200]);
    if probe != IOS_550_HEADER_SHA1 {
        warn!("IOS image does not look like 5.5.0; patches may not apply");
    }

    let hook_addr = find_jumpout(&image)?;
    image.arena_mut().write_word(hook_addr, REGION_SCRATCH.base)?;

    let mut scratch = Arena::new(REGION_SCRATCH);
    let window = scratch.bytes_mut();
    if stub.payload().len() > window.len() {
        return Err(MinuteError::Format(format!(
            "patch stub of {:#x} bytes exceeds the scratch window",
            stub.payload().len()
        )));
    }
    window[..stub.payload().len()].copy_from_slice(stub.payload());
    debug!(hook_addr, stub_len = stub.payload().len(), "jumpout hooked");

    let plugins = if plugins.is_empty() {
        None
    } else {
        let mut chain = PluginChain::new();
        for blob in plugins {
            chain.push(blob)?;
        }
        Some(chain.finalize()?)
    };

    Ok(PatchedImage {
        image,
        scratch,
        plugins,
        hook_addr,
    })
}

/// Scan the first [`JUMPOUT_SCAN_WINDOW`] bytes past the entry vector for
/// the jumpout literal.
fn find_jumpout(image: &BootImage) -> Result<u32> {
    let arena = image.arena();
    for offset in (0..JUMPOUT_SCAN_WINDOW).step_by(4) {
        let Some(addr) = image.entry.checked_add(offset) else {
            break;
        };
        if !arena.region().contains(addr, 4) {
            break;
        }
        if arena.read_word(addr)? == ANCAST_MAGIC_JUMPOUT {
            return Ok(addr);
        }
    }
    Err(MinuteError::Format(format!(
        "no jumpout literal within {JUMPOUT_SCAN_WINDOW:#x} bytes of entry {:#010x}",
        image.entry
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testutil::{build_image, ios_body, test_otp};
    use crate::source::MemorySource;
    use mnt_types::{PLUGIN_MAGIC_PLUG, RAMDISK_END_ADDR, REGION_IOP};

    fn image_with_marker(marker_offset: usize, body_len: usize) -> Vec<u8> {
        // Entry sits 0x20 into the body; the marker `marker_offset` bytes
        // past the entry.
        let mut body = ios_body(body_len, 0x20);
        body[0x20 + marker_offset..0x20 + marker_offset + 4]
            .copy_from_slice(&ANCAST_MAGIC_JUMPOUT.to_be_bytes());
        build_image(0x21, 0x01, &body, false)
    }

    #[test]
    fn builtin_stub_is_a_passthrough_trampoline() {
        let stub = PatchStub::builtin();
        assert_eq!(
            stub.payload(),
            &[0xE5, 0x1F, 0xF0, 0x04, 0xFF, 0xFF, 0x00, 0x00]
        );
    }

    #[test]
    fn blob_validation() {
        assert!(matches!(
            PatchStub::from_blob(b"SALT"),
            Err(MinuteError::Parse(ParseError::InsufficientData { .. }))
        ));
        assert!(matches!(
            PatchStub::from_blob(b"SALTWTCH\x00\x00\x00\x01\x00"),
            Err(MinuteError::Parse(ParseError::InvalidMagic { .. }))
        ));
        assert!(matches!(
            PatchStub::from_blob(b"SALTPTCH\x00\x00\x00\x02\x00"),
            Err(MinuteError::Parse(ParseError::InvalidField { field: "version", .. }))
        ));
        assert!(matches!(
            PatchStub::from_blob(b"SALTPTCH\x00\x00\x00\x01"),
            Err(MinuteError::Parse(ParseError::InvalidField { field: "payload", .. }))
        ));

        let stub = PatchStub::from_blob(b"SALTPTCH\x00\x00\x00\x01\xEA\xFF\xFF\xFE")
            .expect("valid blob");
        assert_eq!(stub.payload(), &[0xEA, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn hooks_the_jumpout_into_the_scratch_window() {
        let image = image_with_marker(0x40, 0x200);
        let mut source = MemorySource::new(&image);
        let stub = PatchStub::builtin();

        let patched = load_patched(&mut source, &test_otp(), &stub, &[]).expect("patch load");
        // Entry = base + header 0x100 + ios header_size 0x20.
        assert_eq!(patched.image.entry, REGION_IOP.base + 0x120);
        assert_eq!(patched.hook_addr, patched.image.entry + 0x40);
        assert_eq!(
            patched.image.arena().read_word(patched.hook_addr).expect("hook"),
            REGION_SCRATCH.base
        );
        assert_eq!(&patched.scratch.bytes()[..8], stub.payload());
        assert!(patched.plugins.is_none());
    }

    #[test]
    fn missing_marker_is_a_hard_error() {
        let body = ios_body(0x200, 0x20);
        let image = build_image(0x21, 0x01, &body, false);
        let mut source = MemorySource::new(&image);
        assert!(matches!(
            load_patched(&mut source, &test_otp(), &PatchStub::builtin(), &[]),
            Err(MinuteError::Format(_))
        ));
    }

    #[test]
    fn marker_at_the_scan_boundary_is_not_found() {
        // One word past the window: scan covers [entry, entry + 0x1000).
        let image = image_with_marker(0x1000, 0x1040);
        let mut source = MemorySource::new(&image);
        assert!(load_patched(&mut source, &test_otp(), &PatchStub::builtin(), &[]).is_err());

        let image = image_with_marker(0xFFC, 0x1040);
        let mut source = MemorySource::new(&image);
        let patched = load_patched(&mut source, &test_otp(), &PatchStub::builtin(), &[])
            .expect("marker on the last scanned word");
        assert_eq!(patched.hook_addr, patched.image.entry + 0xFFC);
    }

    #[test]
    fn plugin_blobs_are_chained_below_the_ramdisk_top() {
        let image = image_with_marker(0x40, 0x200);
        let mut source = MemorySource::new(&image);

        let mut blob = vec![0_u8; 0x20];
        blob[..4].copy_from_slice(&0x7F45_4C46_u32.to_be_bytes());
        let patched = load_patched(
            &mut source,
            &test_otp(),
            &PatchStub::builtin(),
            &[blob.as_slice()],
        )
        .expect("patch load");

        let plugins = patched.plugins.expect("plugin window");
        let anchor = RAMDISK_END_ADDR - 8;
        assert_eq!(plugins.read_word(anchor).expect("anchor"), PLUGIN_MAGIC_PLUG);
    }
}
