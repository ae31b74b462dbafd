//! Install inspection: find the copy boot would pick and grade the health
//! of all four.

use mnt_crypto::Otp;
use mnt_error::{MinuteError, Result};
use mnt_isfs::{find_super, read_super, Volume};
use mnt_ondisk::IsfshaxInfo;
use mnt_types::{Generation, SuperSlot, ISFSHAX_GENERATION_FIRST};
use serde::{Deserialize, Serialize};

/// The newest installed copy, as the boot ROM would pick it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledState {
    /// Physical slot the winning copy occupies.
    pub slot: SuperSlot,
    pub generation: Generation,
    pub info: IsfshaxInfo,
}

/// Scan the reserved generation window and read the winning copy back.
pub fn read_installed(volume: &mut Volume, otp: &Otp) -> Result<InstalledState> {
    volume.load_keys(otp, 1);
    let found = find_super(
        volume,
        Generation(ISFSHAX_GENERATION_FIRST),
        Generation(u32::MAX),
    )
    .ok_or_else(|| MinuteError::NotFound {
        name: format!("isfshax install on {}", volume.id()),
    })?;
    let (superblock, _) = read_super(volume, found.slot)?;
    let info = superblock.isfshax_info().ok_or_else(|| {
        MinuteError::Format(format!(
            "slot {} in the reserved window carries no info block",
            found.slot
        ))
    })?;
    Ok(InstalledState {
        slot: found.slot,
        generation: found.generation,
        info,
    })
}

/// How one copy read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotCondition {
    /// Verified clean.
    Clean,
    /// Readable after single-bit correction.
    Corrected,
    /// Only one of the two spare HMAC copies matched.
    Degraded,
    /// The verified read failed.
    Unreadable,
    /// Flagged bad in the info block; not read.
    Skipped,
}

/// Health of one position in the redundancy ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHealth {
    pub position: u8,
    pub slot: SuperSlot,
    /// Whether this is the copy boot picked.
    pub current: bool,
    pub flagged_bad: bool,
    pub flagged_correctable: bool,
    pub condition: SlotCondition,
    /// Generation the copy carries, when readable.
    pub generation: Option<Generation>,
}

/// Full install report for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsfshaxStatus {
    pub slot: SuperSlot,
    pub generation: Generation,
    pub generation_base: Generation,
    pub index: u32,
    pub slots: Vec<SlotHealth>,
}

/// Grade every copy of the install.
pub fn status(volume: &mut Volume, otp: &Otp) -> Result<IsfshaxStatus> {
    let installed = read_installed(volume, otp)?;

    let mut slots = Vec::with_capacity(installed.info.slots.len());
    for (position, slot) in installed.info.slots.iter().enumerate() {
        let (condition, generation) = if slot.bad {
            (SlotCondition::Skipped, None)
        } else {
            match read_super(volume, slot.super_slot()) {
                Ok((copy, status)) => {
                    let generation = copy.isfshax_info().map(|info| info.generation);
                    let condition = if status.hmac_partial {
                        SlotCondition::Degraded
                    } else if status.ecc_corrected {
                        SlotCondition::Corrected
                    } else {
                        SlotCondition::Clean
                    };
                    (condition, generation)
                }
                Err(_) => (SlotCondition::Unreadable, None),
            }
        };
        slots.push(SlotHealth {
            position: position as u8,
            slot: slot.super_slot(),
            current: position as u32 == installed.info.index,
            flagged_bad: slot.bad,
            flagged_correctable: slot.ecc_correctable,
            condition,
            generation,
        });
    }

    Ok(IsfshaxStatus {
        slot: installed.slot,
        generation: installed.generation,
        generation_base: installed.info.generation_base,
        index: installed.info.index,
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        damage_hmac_copy, damage_one_bit, damage_two_bits, default_slots, install,
        install_with_slots, test_otp,
    };
    use mnt_isfs::{VolumeDevice, VolumeId};
    use mnt_nand::{MemNand, NandBank};
    use std::sync::Arc;

    const FIRST: u32 = ISFSHAX_GENERATION_FIRST;

    #[test]
    fn the_newest_copy_wins_the_install_scan() {
        let mut rig = install([FIRST + 1, FIRST + 4, FIRST + 2, FIRST + 3], 1);
        let installed = read_installed(&mut rig.volume, &test_otp()).expect("scan");
        assert_eq!(installed.slot, SuperSlot(61));
        assert_eq!(installed.generation, Generation(FIRST + 4));
        assert_eq!(installed.info.index, 1);
    }

    #[test]
    fn a_volume_without_an_install_reports_not_found() {
        let mut rig = install([FIRST, FIRST + 1, FIRST + 2, FIRST + 3], 3);
        // A bank with nothing in the reserved window.
        let nand = Arc::new(MemNand::new(NandBank::Slc));
        let mut volume = Volume::new(VolumeId::Slc, VolumeDevice::Nand(nand));
        match read_installed(&mut volume, &test_otp()) {
            Err(MinuteError::NotFound { name }) => assert!(name.contains("slc")),
            other => panic!("expected missing install, got {other:?}"),
        }
        // The populated rig still scans fine.
        assert!(read_installed(&mut rig.volume, &test_otp()).is_ok());
    }

    #[test]
    fn every_condition_is_graded() {
        let mut slots = default_slots();
        slots[1].ecc_correctable = true;
        slots[3].bad = true;
        let mut rig = install_with_slots(slots, [FIRST + 3, FIRST + 2, FIRST + 1, FIRST], 0);
        damage_one_bit(&rig.nand, SuperSlot(61));
        damage_two_bits(&rig.nand, SuperSlot(62));

        let report = status(&mut rig.volume, &test_otp()).expect("status");
        assert_eq!(report.slot, SuperSlot(60));
        assert_eq!(report.generation, Generation(FIRST + 3));
        assert_eq!(report.generation_base, Generation(FIRST));
        assert_eq!(report.index, 0);

        let conditions: Vec<_> = report.slots.iter().map(|s| s.condition).collect();
        assert_eq!(
            conditions,
            [
                SlotCondition::Clean,
                SlotCondition::Corrected,
                SlotCondition::Unreadable,
                SlotCondition::Skipped,
            ]
        );
        assert!(report.slots[0].current);
        assert!(!report.slots[1].current);
        assert!(report.slots[1].flagged_correctable);
        assert!(report.slots[3].flagged_bad);
        assert_eq!(report.slots[0].generation, Some(Generation(FIRST + 3)));
        assert_eq!(report.slots[1].generation, Some(Generation(FIRST + 2)));
        assert_eq!(report.slots[2].generation, None);
        assert_eq!(report.slots[3].generation, None);
    }

    #[test]
    fn a_torn_hmac_copy_grades_as_degraded() {
        let mut rig = install([FIRST + 3, FIRST + 2, FIRST + 1, FIRST], 0);
        damage_hmac_copy(&rig.nand, SuperSlot(62));
        let report = status(&mut rig.volume, &test_otp()).expect("status");
        assert_eq!(report.slots[2].condition, SlotCondition::Degraded);
        assert_eq!(report.slots[2].generation, Some(Generation(FIRST + 1)));
    }
}
