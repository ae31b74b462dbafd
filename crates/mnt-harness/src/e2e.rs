//! End-to-end boot scenarios over in-memory media.
//!
//! Each scenario builds deterministic media, walks the boot path the way
//! the second stage does, and emits a serializable report of what the run
//! picked and why. The harness binary prints the reports; the integration
//! tests assert on them.

use anyhow::{Context, Result, bail};
use mnt_ancast::{load_iop, BootStage, MemorySource};
use mnt_crypto::sha1;
use mnt_isfs::{load_super, write_super, Filesystem};
use mnt_isfshax::{refresh, status, RefreshOutcome, SlotCondition};
use mnt_prsh::{InitOutcome, PrshStore};
use mnt_types::{
    Generation, SuperSlot, ISFSHAX_GENERATION_FIRST, ISFSHAX_REDUNDANCY, REGION_IOP, REGION_PRSH,
};
use serde::{Deserialize, Serialize};

use crate::images;

// ── Full boot chain ─────────────────────────────────────────────────────────

/// Knobs for the full boot chain run.
#[derive(Debug, Clone)]
pub struct BootScenarioConfig {
    /// Run with a fused console dump, ciphering the persistent window.
    pub fused: bool,
    /// Size of the firmware body staged on the volume.
    pub body_len: usize,
    /// Generation of the committed superblock.
    pub generation: u32,
}

impl Default for BootScenarioConfig {
    fn default() -> Self {
        Self {
            fused: false,
            body_len: 0x8000,
            generation: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootReport {
    pub volume: String,
    pub slot: u8,
    pub generation: u32,
    pub key_version: u8,
    pub firmware: FirmwareReport,
    pub prsh: PrshReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareReport {
    pub path: String,
    pub size: u32,
    pub entry: u32,
    pub firmware_version: u32,
    /// Digest of the body as staged, i.e. after decryption.
    pub body_sha1: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrshReport {
    pub outcome: InitOutcome,
    pub records: usize,
    pub ciphered: bool,
}

/// Walk the boot chain end to end: mount the newest superblock, read the
/// staged firmware out of the filesystem, verify and stage it, then seed
/// the persistent window and hand it off.
pub fn run_boot_scenario(config: &BootScenarioConfig) -> Result<BootReport> {
    let otp = if config.fused {
        images::fused_otp()?
    } else {
        images::test_otp()?
    };

    let body = images::iop_body(config.body_len, 0x20)?;
    let firmware = images::ancast_image(&otp, 0x21, 0x01, &body, true)?;
    let mut builder = images::TreeBuilder::new(&otp, Generation(config.generation))?;
    let root = builder.root();
    let sys = builder.add_dir(root, "sys")?;
    builder.add_file(sys, "fw.img", &firmware)?;
    let (_nand, volume) = builder.build(SuperSlot(2))?;

    let fs = Filesystem::mount(volume, &otp).context("mount boot volume")?;
    let path = "/sys/fw.img";
    let mut handle = fs.open(path)?;
    let size = fs.file_size(&handle)?;
    let mut image = vec![0_u8; size as usize];
    let read = fs.read(&mut handle, &mut image)?;
    if read != image.len() {
        bail!("short firmware read: {read} of {} bytes", image.len());
    }

    let mut source = MemorySource::new(&image);
    let staged = load_iop(&mut source, &otp, BootStage::Stage2).context("stage firmware")?;
    let body_start = staged.header.header_size();
    let staged_body =
        &staged.arena().bytes()[body_start..body_start + staged.header.body_size as usize];
    let body_sha1 = hex::encode(sha1(staged_body));

    // Seed a persistent window the way a cold boot would and hand it off.
    let window = vec![0_u8; REGION_PRSH.len as usize];
    let (mut store, outcome) = PrshStore::init(window, &otp)?;
    store.add_entry("boot_image", REGION_IOP.base, size)?;
    let records = store.entries()?.len();
    let window = store.handoff(&otp)?;
    if window.len() != REGION_PRSH.len as usize {
        bail!("handoff changed the window size");
    }

    Ok(BootReport {
        volume: fs.volume().id().to_string(),
        slot: fs.state().slot.0,
        generation: fs.state().generation.0,
        key_version: fs.state().version,
        firmware: FirmwareReport {
            path: path.to_owned(),
            size,
            entry: staged.entry,
            firmware_version: staged.header.version,
            body_sha1,
        },
        prsh: PrshReport {
            outcome,
            records,
            ciphered: otp.prsh_crypto_enabled(),
        },
    })
}

// ── Superblock fallback ─────────────────────────────────────────────────────

/// Knobs for the superblock fallback run.
#[derive(Debug, Clone)]
pub struct FallbackScenarioConfig {
    /// Generations committed to the first four slots, in slot order.
    pub generations: [u32; 4],
    /// Wear the winning slot out and mount again.
    pub damage_newest: bool,
}

impl Default for FallbackScenarioConfig {
    fn default() -> Self {
        Self {
            generations: [10, 12, 11, 9],
            damage_newest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanPick {
    pub slot: u8,
    pub generation: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackReport {
    pub initial: ScanPick,
    pub after_damage: Option<ScanPick>,
}

/// Commit one superblock per slot, mount, then wear the winner out and
/// mount again: the scan must fall back to the next-newest generation.
pub fn run_fallback_scenario(config: &FallbackScenarioConfig) -> Result<FallbackReport> {
    let otp = images::test_otp()?;
    let (nand, mut volume) = images::keyed_slc(&otp);

    for (i, generation) in config.generations.iter().enumerate() {
        let superblock =
            images::formatted_superblock(1, images::SLC_SUPER_COUNT, Generation(*generation))?;
        write_super(&volume, SuperSlot(i as u8), &superblock)?;
    }

    let state = load_super(&mut volume, &otp)?;
    let initial = ScanPick {
        slot: state.slot.0,
        generation: state.generation.0,
    };

    let after_damage = if config.damage_newest {
        images::flip_uncorrectable_bits(&nand, state.slot)?;
        let state = load_super(&mut volume, &otp)?;
        Some(ScanPick {
            slot: state.slot.0,
            generation: state.generation.0,
        })
    } else {
        None
    };

    Ok(FallbackReport {
        initial,
        after_damage,
    })
}

// ── Recovery ring refresh ───────────────────────────────────────────────────

/// Knobs for the recovery refresh run.
#[derive(Debug, Clone)]
pub struct RecoveryScenarioConfig {
    /// Ring position that takes a hit before the pass. Position 0 is the
    /// booted copy; it is worn through an HMAC copy instead of a data bit
    /// so the copy stays readable.
    pub worn_position: usize,
}

impl Default for RecoveryScenarioConfig {
    fn default() -> Self {
        Self { worn_position: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub booted_slot: u8,
    pub booted_generation: u32,
    pub conditions_before: Vec<SlotCondition>,
    pub refresh: RefreshOutcome,
    pub conditions_after: Vec<SlotCondition>,
}

/// Install a four-copy recovery ring, wear one copy, and run the per-boot
/// refresh pass over it.
pub fn run_recovery_scenario(config: &RecoveryScenarioConfig) -> Result<RecoveryReport> {
    if config.worn_position >= ISFSHAX_REDUNDANCY {
        bail!(
            "worn position {} outside the {ISFSHAX_REDUNDANCY}-slot ring",
            config.worn_position
        );
    }

    let otp = images::test_otp()?;
    let first = ISFSHAX_GENERATION_FIRST;
    let mut rig = images::install_recovery(
        &otp,
        images::recovery_ring(),
        [first + 3, first + 2, first + 1, first],
        0,
    )?;

    let worn_slot = rig.info.slots[config.worn_position].super_slot();
    if config.worn_position == 0 {
        images::tear_hmac_copy(&rig.nand, worn_slot)?;
    } else {
        images::flip_correctable_bit(&rig.nand, worn_slot)?;
    }

    let before = status(&mut rig.volume, &otp)?;
    let outcome = refresh(&mut rig.volume, &otp, &rig.info)?;
    let after = status(&mut rig.volume, &otp)?;

    Ok(RecoveryReport {
        booted_slot: before.slot.0,
        booted_generation: before.generation.0,
        conditions_before: before.slots.iter().map(|s| s.condition).collect(),
        refresh: outcome,
        conditions_after: after.slots.iter().map(|s| s.condition).collect(),
    })
}
