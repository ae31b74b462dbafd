//! Superblock slot management: generation scan, verified load, isfshax
//! detection, and the rotating commit.
//!
//! The top of each volume holds a ring of superblock slots, 16 clusters
//! apiece. Every committed superblock carries a generation counter, and a
//! mount scans all slots for the newest one it can verify. An isfshax
//! installation parks its own superblocks in a reserved generation window
//! well above anything a normal filesystem reaches; the mount detects those
//! first, remembers which physical slots they occupy, and then restricts
//! the real scan to generations below the window.

use mnt_crypto::Otp;
use mnt_error::{MinuteError, Result};
use mnt_ondisk::{slot_cluster, Superblock, SuperblockHeader};
use mnt_types::{
    ClusterIndex, FatEntry, Generation, SuperSlot, CLUSTER_SIZE, ISFSHAX_GENERATION_FIRST,
    ISFSHAX_REDUNDANCY, SUPER_CLUSTERS, SUPER_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::volume::{HmacSeed, ReadStatus, Volume, VolumeFlags, WriteStatus};

/// Result of a slot scan: the newest valid superblock in a generation
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundSuper {
    pub slot: SuperSlot,
    pub generation: Generation,
    /// Key-set version decoded from the superblock magic.
    pub version: u8,
}

/// Everything a successful mount established.
pub struct MountState {
    /// Slot the mounted superblock was read from.
    pub slot: SuperSlot,
    /// Generation of the mounted superblock, as read.
    pub generation: Generation,
    pub version: u8,
    /// The in-memory superblock. Commits write this buffer out, and its
    /// generation field moves ahead of `generation` above as they do.
    pub superblock: Superblock,
    /// Physical slots claimed by an isfshax installation, kept off-limits
    /// to the commit rotation. `None` when no installation was detected.
    pub isfshax_slots: Option<[SuperSlot; ISFSHAX_REDUNDANCY]>,
}

impl MountState {
    /// True when the mount scan found an isfshax installation.
    #[must_use]
    pub fn is_isfshax(&self) -> bool {
        self.isfshax_slots.is_some()
    }
}

/// Scan every slot for the newest parseable superblock with generation in
/// `[min, max)`.
///
/// Reads one cluster per slot, raw: no keys needed. Unreadable slots and
/// slots without a superblock magic are skipped. Ties on generation go to
/// the later slot.
#[must_use]
pub fn find_super(volume: &Volume, min: Generation, max: Generation) -> Option<FoundSuper> {
    let count = volume.id().super_count();
    let mut newest: Option<FoundSuper> = None;
    let mut buf = vec![0_u8; CLUSTER_SIZE];

    for raw in 0..count {
        let slot = SuperSlot(raw);
        let Some(cluster) = slot_cluster(count, slot) else {
            continue;
        };
        if volume
            .read_volume(cluster, VolumeFlags::NONE, None, &mut buf)
            .is_err()
        {
            continue;
        }
        let Ok(header) = SuperblockHeader::parse(&buf) else {
            continue;
        };
        if header.generation < min || header.generation >= max {
            continue;
        }
        if let Some(cur) = &newest {
            if header.generation < cur.generation {
                continue;
            }
        }
        newest = Some(FoundSuper {
            slot,
            generation: header.generation,
            version: header.version,
        });
    }

    if let Some(found) = &newest {
        debug!(
            volume = %volume.id(),
            slot = %found.slot,
            generation = %found.generation,
            version = found.version,
            "slot scan hit"
        );
    }
    newest
}

/// Read and verify the full superblock in `slot`.
///
/// The read is HMAC-checked against the slot's seed; the data itself is not
/// encrypted on flash. The status reports corrections and single-copy HMAC
/// matches the caller may want to act on.
pub fn read_super(volume: &Volume, slot: SuperSlot) -> Result<(Superblock, ReadStatus)> {
    let cluster = super_cluster(volume, slot)?;
    let seed = HmacSeed::superblock(cluster);
    let mut buf = vec![0_u8; SUPER_SIZE];
    let status = volume.read_volume(cluster, VolumeFlags::HMAC, Some(&seed), &mut buf)?;
    if status.hmac_partial {
        warn!(volume = %volume.id(), %slot, "superblock carries only one valid HMAC copy");
    }
    Ok((Superblock::from_bytes(buf)?, status))
}

/// Write a full superblock into `slot`, with readback verification.
pub fn write_super(
    volume: &Volume,
    slot: SuperSlot,
    superblock: &Superblock,
) -> Result<WriteStatus> {
    let cluster = super_cluster(volume, slot)?;
    let seed = HmacSeed::superblock(cluster);
    volume.write_volume(
        cluster,
        VolumeFlags::HMAC_READBACK,
        Some(&seed),
        superblock.as_bytes(),
    )
}

fn super_cluster(volume: &Volume, slot: SuperSlot) -> Result<ClusterIndex> {
    let count = volume.id().super_count();
    slot_cluster(count, slot).ok_or_else(|| {
        MinuteError::Format(format!(
            "superblock slot {slot} out of range (volume has {count} slots)"
        ))
    })
}

/// Find and load the newest verifiable superblock with generation in
/// `[min, max)`.
///
/// A slot that scans clean but fails the verified read caps the window at
/// its generation and the scan repeats, stepping down through history until
/// a superblock verifies or the window empties. Keys are selected per
/// attempt from the scanned version.
pub fn load_super_range(
    volume: &mut Volume,
    otp: &Otp,
    min: Generation,
    max: Generation,
) -> Option<(FoundSuper, Superblock)> {
    let mut upper = max;
    while let Some(found) = find_super(volume, min, upper) {
        volume.load_keys(otp, found.version);
        match read_super(volume, found.slot) {
            Ok((superblock, _)) => return Some((found, superblock)),
            Err(err) => {
                warn!(
                    volume = %volume.id(),
                    slot = %found.slot,
                    generation = %found.generation,
                    %err,
                    "superblock failed the verified read, stepping down"
                );
                upper = found.generation;
            }
        }
    }
    None
}

/// Mount scan: detect an isfshax installation, then load the newest normal
/// superblock.
///
/// Phase one searches the reserved generation window. When it verifies a
/// superblock that carries the isfshax info block, the four physical slots
/// it names are cached and phase two is capped below the window; otherwise
/// phase two scans the full range. Phase two's result is the mount, and its
/// failure fails the mount even when phase one succeeded.
pub fn load_super(volume: &mut Volume, otp: &Otp) -> Result<MountState> {
    let mut max = Generation(u32::MAX);
    let mut isfshax_slots = None;

    if let Some((found, superblock)) = load_super_range(
        volume,
        otp,
        Generation(ISFSHAX_GENERATION_FIRST),
        Generation(u32::MAX),
    ) {
        if let Some(info) = superblock.isfshax_info() {
            info!(
                volume = %volume.id(),
                generation = %found.generation,
                "isfshax installation detected"
            );
            isfshax_slots = Some(info.slots.map(|slot| slot.super_slot()));
            max = Generation(ISFSHAX_GENERATION_FIRST);
        }
    }

    let (found, superblock) =
        load_super_range(volume, otp, Generation(0), max).ok_or_else(|| MinuteError::NotFound {
            name: format!("{} superblock", volume.id()),
        })?;
    info!(
        volume = %volume.id(),
        slot = %found.slot,
        generation = %found.generation,
        version = found.version,
        "superblock mounted"
    );
    Ok(MountState {
        slot: found.slot,
        generation: found.generation,
        version: found.version,
        superblock,
        isfshax_slots,
    })
}

/// Commit the buffered superblock to the next usable slot.
///
/// The buffer's generation is bumped first, then slots are tried in
/// rotation starting after the mounted one, with the mounted slot itself as
/// the last resort. isfshax slots and slots whose clusters are not all
/// reserved are skipped. A slot that refuses the write has its clusters
/// marked bad in the buffered FAT and the generation is bumped again, so a
/// torn write can never outrank the commit that follows it. The mount
/// bookkeeping (`slot`, `generation`) stays put; only the buffer changes.
pub fn commit_super(volume: &Volume, state: &mut MountState) -> Result<SuperSlot> {
    let count = volume.id().super_count();
    bump_generation(&mut state.superblock)?;

    for i in 1..=count {
        let slot = SuperSlot((state.slot.0 + i) % count);
        if let Some(hax) = &state.isfshax_slots {
            if hax.contains(&slot) {
                continue;
            }
        }
        let Some(first) = slot_cluster(count, slot) else {
            continue;
        };
        if !slot_reserved(&state.superblock, first)? {
            continue;
        }

        match write_super(volume, slot, &state.superblock) {
            Ok(status) => {
                if status.ecc_corrected {
                    warn!(
                        volume = %volume.id(),
                        %slot,
                        "committed superblock needed correction on readback"
                    );
                }
                let generation = state.superblock.generation()?;
                info!(volume = %volume.id(), %slot, %generation, "superblock committed");
                return Ok(slot);
            }
            Err(err) => {
                warn!(
                    volume = %volume.id(),
                    %slot,
                    %err,
                    "superblock commit failed, marking slot bad"
                );
                for c in 0..SUPER_CLUSTERS {
                    state
                        .superblock
                        .set_fat(ClusterIndex(first.0 + c), FatEntry::Bad)?;
                }
                bump_generation(&mut state.superblock)?;
            }
        }
    }

    Err(MinuteError::NoRedundancy)
}

fn slot_reserved(superblock: &Superblock, first: ClusterIndex) -> Result<bool> {
    for c in 0..SUPER_CLUSTERS {
        if superblock.fat(ClusterIndex(first.0 + c))? != FatEntry::Reserved {
            return Ok(false);
        }
    }
    Ok(true)
}

fn bump_generation(superblock: &mut Superblock) -> Result<()> {
    let next = superblock
        .generation()?
        .next()
        .ok_or_else(|| MinuteError::Format("superblock generation counter wrapped".to_string()))?;
    superblock.set_generation(next)?;
    Ok(())
}
