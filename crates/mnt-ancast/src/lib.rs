#![forbid(unsafe_code)]
//! Ancast image loader.
//!
//! An ancast image is the signed container both processors boot from: a
//! magic/signature prologue, a 0x60-byte header carrying the target device
//! and a SHA-1 of the body, then the body itself. This crate takes an image
//! from any of the three fronts the boot path uses (a file, a raw SD sector
//! range, an in-memory copy), stages it into the fixed load window its
//! header selects, checks the body hash, decrypts IOP bodies when they are
//! stored ciphered, and resolves the entry vector the caller jumps to.
//!
//! RAM at a fixed physical address is modeled by [`Arena`]: an owned buffer
//! paired with the [`mnt_types::MemRegion`] it stands for, so every load is
//! bounds-checked and inspectable on a host. On top of the plain loaders sit
//! the elfldr patch flow (redirect the loader's jumpout into a stub staged
//! in the scratch window) and the plugin chain builder that lays ELF and
//! DATA blobs below the ramdisk top for the patched kernel to pick up.

pub mod arena;
pub mod loader;
pub mod patch;
pub mod plugins;
pub mod source;

pub use arena::Arena;
pub use loader::{
    load_image, load_iop, load_ppc, resolve_load_region, BootImage, BootStage, ImageInfo,
    LoadedImage,
};
pub use patch::{load_patched, PatchStub, PatchedImage, SALTPTCH_HEADER_SIZE};
pub use plugins::PluginChain;
pub use source::{FileSource, ImageSource, MemorySource, SectorSource, ANCAST_PROBE_SIZE};
