//! The per-boot refresh pass over the four installed copies.
//!
//! Boot picks the newest copy in the reserved generation window. Refresh
//! re-reads the other three and the booted one, and rewrites the first copy
//! that shows wear: a corrected ECC bit, a single surviving HMAC copy, or a
//! failed read. When the booted copy itself is clean, the rewrite reuses a
//! free generation below it so the booted copy stays the scan winner; wear
//! on the booted copy forces a newer generation so the next boot moves on.
//! Copies that fail their rewrite are flagged bad in the info block carried
//! by every copy, and the write generation jumps well past the torn attempt
//! so a half-written copy can never win a scan.

use mnt_crypto::Otp;
use mnt_error::{MinuteError, Result};
use mnt_isfs::{read_super, write_super, ReadStatus, Volume};
use mnt_ondisk::{IsfshaxInfo, Superblock};
use mnt_types::{
    Generation, SuperSlot, ISFSHAX_GENERATION_FIRST, ISFSHAX_GENERATION_RANGE,
    ISFSHAX_REDUNDANCY,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a refresh pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshEvent {
    /// Every copy read back acceptably; nothing was written.
    Healthy,
    /// A worn copy was rewritten on the first attempt.
    Rewritten {
        slot: SuperSlot,
        generation: Generation,
    },
    /// At least one copy failed its rewrite before a later one succeeded.
    RewroteAfterFailure {
        slot: SuperSlot,
        generation: Generation,
    },
}

/// Outcome of a refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub event: RefreshEvent,
    /// Copies flagged bad in the info block after the pass.
    pub bad_slots: usize,
}

/// Check all four copies and rewrite the first one showing wear.
///
/// `installed` is the info block of the copy boot picked, which is the
/// newest generation in the reserved window. That copy itself is never
/// overwritten; damage to it is answered by writing a backup with a newer
/// generation.
pub fn refresh(volume: &mut Volume, otp: &Otp, installed: &IsfshaxInfo) -> Result<RefreshOutcome> {
    volume.load_keys(otp, 1);

    let current_index = installed.index as usize;
    let current_slot = installed.current().ok_or_else(|| {
        MinuteError::Format(format!("info block index {} out of range", installed.index))
    })?;

    let mut newest_gen = installed.generation.0;
    let mut rewrite_index = (current_index + 1) % ISFSHAX_REDUNDANCY;
    let mut rewrite_needed = false;
    let mut used_gens = [false; ISFSHAX_REDUNDANCY];

    for i in 1..ISFSHAX_REDUNDANCY {
        let index = (current_index + i) % ISFSHAX_REDUNDANCY;
        let slot = installed.slots[index];
        if slot.bad {
            continue;
        }
        match read_super(volume, slot.super_slot()) {
            Ok((copy, status)) => {
                let Some(copy_info) = copy.isfshax_info() else {
                    // Readable but carrying no info block: wrong content,
                    // treat it like a failed read.
                    warn!(slot = slot.slot, "copy carries no info block");
                    rewrite_index = index;
                    rewrite_needed = true;
                    continue;
                };
                let copy_gen = copy_info.generation.0;
                if !rewrite_needed && needs_rewrite(status, slot.ecc_correctable) {
                    rewrite_index = index;
                    rewrite_needed = true;
                } else {
                    // Track which generations below the newest are taken,
                    // for the free-generation reuse below.
                    let behind = newest_gen.wrapping_sub(copy_gen).wrapping_sub(1);
                    if (behind as usize) < used_gens.len() {
                        used_gens[behind as usize] = true;
                    }
                }
                if newest_gen < copy_gen {
                    newest_gen = copy_gen;
                }
            }
            Err(err) => {
                // Unreadable copies take rewrite priority over worn ones.
                warn!(slot = slot.slot, error = %err, "copy read failed");
                rewrite_index = index;
                rewrite_needed = true;
            }
        }
    }

    if newest_gen > installed.generation.0 {
        return Err(MinuteError::CurrentGenNotLatest {
            current: installed.generation.0,
            seen: newest_gen,
        });
    }

    let (mut superblock, current_status) = match read_super(volume, current_slot.super_slot()) {
        Ok(read) => read,
        Err(err) => {
            warn!(slot = current_slot.slot, error = %err, "booted copy read failed");
            return Err(MinuteError::CurrentSlotBad {
                slot: current_slot.slot,
            });
        }
    };
    let mut info = superblock.isfshax_info().ok_or(MinuteError::CurrentSlotBad {
        slot: current_slot.slot,
    })?;

    let update_generation = needs_rewrite(current_status, current_slot.ecc_correctable);
    if update_generation {
        rewrite_needed = true;
    }
    if !rewrite_needed {
        let bad_slots = flagged_bad(installed);
        debug!(bad_slots, "all copies acceptable");
        return Ok(RefreshOutcome {
            event: RefreshEvent::Healthy,
            bad_slots,
        });
    }

    let mut write_gen = newest_gen.saturating_add(1);
    if !update_generation {
        let behind = used_gens.iter().take_while(|&&used| used).count();
        if behind < used_gens.len() {
            let free_gen = newest_gen - behind as u32 - 1;
            if free_gen >= ISFSHAX_GENERATION_FIRST {
                write_gen = free_gen;
            }
        }
    }

    for attempt in 0..ISFSHAX_REDUNDANCY {
        if rewrite_index == current_index {
            // The ring wrapped onto the booted copy; nothing left to try.
            continue;
        }
        if write_gen > ISFSHAX_GENERATION_FIRST + ISFSHAX_GENERATION_RANGE {
            return Err(MinuteError::GenerationRangeExhausted {
                generation: write_gen,
            });
        }
        match rewrite_slot(volume, &mut superblock, &mut info, rewrite_index, write_gen) {
            Ok(corrected) => {
                let slot = info.slots[rewrite_index].super_slot();
                let generation = Generation(write_gen);
                info!(%slot, %generation, corrected, "copy rewritten");
                let event = if attempt == 0 {
                    RefreshEvent::Rewritten { slot, generation }
                } else {
                    RefreshEvent::RewroteAfterFailure { slot, generation }
                };
                return Ok(RefreshOutcome {
                    event,
                    bad_slots: flagged_bad(&info),
                });
            }
            Err(err) => {
                warn!(slot = info.slots[rewrite_index].slot, error = %err, "rewrite failed");
                info.slots[rewrite_index].bad = true;
                // Jump past every generation a torn write could carry.
                write_gen = newest_gen + ISFSHAX_REDUNDANCY as u32 + attempt as u32;
                rewrite_index = (rewrite_index + 1) % ISFSHAX_REDUNDANCY;
            }
        }
    }

    Err(MinuteError::NoRedundancy)
}

/// Whether a copy that read back with `status` should be rewritten. A copy
/// already flagged as carrying a correctable error is left alone as long
/// as correction is all it needed.
fn needs_rewrite(status: ReadStatus, flagged_correctable: bool) -> bool {
    if !status.ecc_corrected && !status.hmac_partial {
        return false;
    }
    if status.ecc_corrected && !status.hmac_partial && flagged_correctable {
        return false;
    }
    true
}

fn flagged_bad(info: &IsfshaxInfo) -> usize {
    info.slots.iter().filter(|slot| slot.bad).count()
}

/// Write one copy carrying `generation` and claiming `index`.
///
/// A corrected readback is retried once silently; a second one flags the
/// copy correctable in the info block, and with the flag set a corrected
/// readback counts as success. Returns whether the accepted write needed
/// correction.
fn rewrite_slot(
    volume: &Volume,
    superblock: &mut Superblock,
    info: &mut IsfshaxInfo,
    index: usize,
    generation: u32,
) -> Result<bool> {
    info.generation = Generation(generation);
    info.index = index as u32;
    superblock.set_generation(Generation(generation))?;

    let mut retries = 3;
    loop {
        superblock.set_isfshax_info(info)?;
        let target = info.slots[index].super_slot();
        let result = write_super(volume, target, superblock);
        match &result {
            Ok(status) if !status.ecc_corrected => return Ok(false),
            Ok(_) => {
                if info.slots[index].ecc_correctable {
                    return Ok(true);
                }
                if retries < 3 {
                    info.slots[index].ecc_correctable = true;
                    retries += 1;
                }
            }
            Err(_) => {}
        }
        retries -= 1;
        if retries == 0 {
            return result.map(|status| status.ecc_corrected);
        }
    }
}
