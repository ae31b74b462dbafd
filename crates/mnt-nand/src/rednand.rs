//! redNAND: redirecting flash banks to SD card partitions.
//!
//! A card set up for redirection carries dedicated partitions for the
//! redirected volumes. Two layouts exist in the wild:
//!
//! - the modern layout, one partition per volume with its own type code
//!   ([`PART_TYPE_MLC`], [`PART_TYPE_SLC`], [`PART_TYPE_SLCCMPT`], plus
//!   [`PART_TYPE_MLC_NOSCFM`] which doubles as anscfm-disable marker), and
//! - the legacy layout written by old format tools: three type-0xAE entries
//!   where the last spans both SLC banks back to back.
//!
//! Which discovered partitions actually get used is decided by the config
//! file: discovery never enables anything by itself. [`apply_settings`]
//! merges the two and rejects combinations that would corrupt the system
//! cache (scfm) state.
//!
//! Redirected SLC banks carry cluster payloads only. There is no spare
//! area on SD, so HMAC spare copies never round-trip through a redirected
//! bank and the volume layer stores those clusters encrypted-only.

use std::sync::Arc;

use mnt_error::{MinuteError, Result};
use mnt_ondisk::mbr::{Mbr, PartitionEntry};
use mnt_types::{
    ClusterIndex, SectorIndex, CLUSTER_COUNT, CLUSTER_SIZE, NAND_PAGE_COUNT, PAGE_SIZE,
    SECTOR_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::SectorDevice;

/// Partition type: redirected MLC.
pub const PART_TYPE_MLC: u8 = 0x0D;
/// Partition type: redirected MLC with the system cache (scfm) disabled.
pub const PART_TYPE_MLC_NOSCFM: u8 = 0x0C;
/// Partition type: redirected SLC.
pub const PART_TYPE_SLC: u8 = 0x0E;
/// Partition type: redirected SLC-compat.
pub const PART_TYPE_SLCCMPT: u8 = 0x0F;
/// Partition type used by the legacy three-entry layout.
pub const PART_TYPE_LEGACY: u8 = 0xAE;

/// Sectors needed for one full SLC bank.
pub const REDSLC_SECTORS: u32 = (NAND_PAGE_COUNT as usize * PAGE_SIZE / SECTOR_SIZE) as u32;
/// MLC partition length in the legacy layout (32 GB model).
pub const LEGACY_MLC_SECTORS: u32 = 0x03A2_0000;
/// Scratch/header partition length in the legacy layout.
pub const LEGACY_DATA_SECTORS: u32 = 0x800;

/// One redirected partition window, in absolute card sectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedPartition {
    pub lba_start: u32,
    pub lba_length: u32,
}

impl RedPartition {
    /// A zero-length window means "not there".
    #[must_use]
    pub fn is_present(self) -> bool {
        self.lba_length != 0
    }
}

/// Partitions found on the card, before config is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RednandPartitions {
    pub mlc: RedPartition,
    pub slc: RedPartition,
    pub slccmpt: RedPartition,
    /// Set when the MLC partition carries the no-scfm type code.
    pub disable_scfm: bool,
}

/// Parsed config file state for redirection.
///
/// The partition keys are tri-state: absent keys behave like `false` but
/// suppress the "partition exists but is not configured" warning logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RednandSettings {
    pub slc: Option<bool>,
    pub slccmpt: Option<bool>,
    pub mlc: Option<bool>,
    pub disable_scfm: bool,
    pub scfm_on_slccmpt: bool,
    pub allow_sys_scfm: bool,
}

/// The active redirection layout after merging config and discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RednandLayout {
    pub mlc: RedPartition,
    pub slc: RedPartition,
    pub slccmpt: RedPartition,
    pub disable_scfm: bool,
    pub scfm_on_slccmpt: bool,
}

impl RednandLayout {
    /// True if any volume is redirected.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.mlc.is_present() || self.slc.is_present() || self.slccmpt.is_present()
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(MinuteError::Config(format!(
            "expected true or false, got {other:?}"
        ))),
    }
}

/// Parse the redirection sections out of a config file.
///
/// Only the `[partiton]` and `[scfm]` sections are consumed here; other
/// sections belong to other subsystems and are skipped. The partition
/// section name matches what shipping config files carry, typo included.
/// Unknown keys inside a consumed section are errors.
pub fn parse_settings(text: &str) -> Result<RednandSettings> {
    let mut out = RednandSettings::default();
    let mut section = String::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(MinuteError::Config(format!(
                    "malformed section header: {line:?}"
                )));
            };
            section = name.trim().to_ascii_lowercase();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(MinuteError::Config(format!("malformed line: {line:?}")));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match section.as_str() {
            "partiton" => {
                let flag = Some(parse_bool(value)?);
                match key.as_str() {
                    "slc" => out.slc = flag,
                    "slccmpt" => out.slccmpt = flag,
                    "mlc" => out.mlc = flag,
                    _ => {
                        return Err(MinuteError::Config(format!(
                            "unknown partition key: {key}"
                        )));
                    }
                }
            }
            "scfm" => {
                let flag = parse_bool(value)?;
                match key.as_str() {
                    "disable" => out.disable_scfm = flag,
                    "on_slccmpt" => out.scfm_on_slccmpt = flag,
                    "allow_sys" => out.allow_sys_scfm = flag,
                    _ => {
                        return Err(MinuteError::Config(format!("unknown scfm key: {key}")));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Detect the legacy three-entry layout: slots 1..3 all type 0xAE, the last
/// one sized for both SLC banks and the middle one for the MLC.
fn check_legacy(mbr: &Mbr) -> Option<RednandPartitions> {
    let parts = &mbr.partitions;
    let legacy = parts[1..4].iter().all(|p| p.part_type == PART_TYPE_LEGACY)
        && parts[3].lba_length == 2 * REDSLC_SECTORS
        && parts[2].lba_length == LEGACY_MLC_SECTORS;
    if !legacy {
        return None;
    }
    let slc_start = parts[3].lba_start;
    Some(RednandPartitions {
        mlc: RedPartition {
            lba_start: parts[2].lba_start,
            lba_length: parts[2].lba_length,
        },
        slc: RedPartition {
            lba_start: slc_start,
            lba_length: REDSLC_SECTORS,
        },
        slccmpt: RedPartition {
            lba_start: slc_start + REDSLC_SECTORS,
            lba_length: REDSLC_SECTORS,
        },
        disable_scfm: false,
    })
}

/// Scan the partition table for redirected volumes.
///
/// The first matching partition of each kind wins; later duplicates are
/// logged and skipped. Slot 0 is never considered, it belongs to the FAT
/// filesystem the loader boots from.
#[must_use]
pub fn discover_partitions(mbr: &Mbr) -> RednandPartitions {
    if let Some(legacy) = check_legacy(mbr) {
        return legacy;
    }

    let mut out = RednandPartitions::default();
    for part in &mbr.partitions[1..4] {
        let (dest, name) = match part.part_type {
            PART_TYPE_MLC_NOSCFM => {
                out.disable_scfm = true;
                (&mut out.mlc, "mlc")
            }
            PART_TYPE_MLC => (&mut out.mlc, "mlc"),
            PART_TYPE_SLC => (&mut out.slc, "slc"),
            PART_TYPE_SLCCMPT => (&mut out.slccmpt, "slccmpt"),
            _ => continue,
        };
        if dest.is_present() {
            warn!(partition = name, "duplicate rednand partition, keeping the first");
            continue;
        }
        *dest = RedPartition {
            lba_start: part.lba_start,
            lba_length: part.lba_length,
        };
    }
    out
}

fn check_apply(name: &'static str, key: Option<bool>, part: RedPartition) -> Result<RedPartition> {
    if !key.unwrap_or(false) {
        if part.is_present() && key.is_none() {
            warn!(partition = name, "partition exists but is not configured");
        }
        return Ok(RedPartition::default());
    }
    if !part.is_present() {
        return Err(MinuteError::Config(format!("no {name} partition found")));
    }
    Ok(part)
}

/// Merge config-file settings with discovered partitions.
///
/// The system cache (scfm) sits on the real MLC; combinations that would
/// let it write stale state onto un-redirected flash must be acknowledged
/// explicitly in the config.
pub fn apply_settings(
    settings: &RednandSettings,
    discovered: &RednandPartitions,
) -> Result<RednandLayout> {
    let slc_on = settings.slc.unwrap_or(false);
    let mlc_on = settings.mlc.unwrap_or(false);

    if !settings.disable_scfm
        && !slc_on
        && !settings.allow_sys_scfm
        && mlc_on
        && !settings.scfm_on_slccmpt
    {
        return Err(MinuteError::Config(
            "using the system scfm with a redirected mlc must be explicitly allowed".to_owned(),
        ));
    }
    if slc_on && !mlc_on && !settings.allow_sys_scfm {
        return Err(MinuteError::Config(
            "using a redirected slc with the system mlc must be explicitly allowed".to_owned(),
        ));
    }
    if slc_on && !mlc_on && settings.disable_scfm {
        return Err(MinuteError::Config(
            "disabling scfm for the system nand is not allowed".to_owned(),
        ));
    }
    if slc_on && !mlc_on && settings.scfm_on_slccmpt {
        return Err(MinuteError::Config(
            "migrating scfm for the system nand is not allowed".to_owned(),
        ));
    }

    let layout = RednandLayout {
        mlc: check_apply("mlc", settings.mlc, discovered.mlc)?,
        slc: check_apply("slc", settings.slc, discovered.slc)?,
        slccmpt: check_apply("slccmpt", settings.slccmpt, discovered.slccmpt)?,
        disable_scfm: settings.disable_scfm,
        scfm_on_slccmpt: settings.scfm_on_slccmpt,
    };

    if layout.mlc.is_present() && settings.disable_scfm != discovered.disable_scfm {
        warn!(
            config = settings.disable_scfm,
            partition_type = discovered.disable_scfm,
            "scfm disable flag differs between config and partition type, config wins"
        );
    }
    if layout.disable_scfm && layout.scfm_on_slccmpt {
        warn!("scfm is disabled, migrating it to slccmpt has no effect");
    }
    Ok(layout)
}

/// Partition plan for seeding a fresh card with the legacy layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyPlan {
    /// Scratch/header window right below the MLC window.
    pub data: RedPartition,
    pub mlc: RedPartition,
    /// Spans both SLC banks; discovery splits it back apart.
    pub slc: RedPartition,
}

/// Compute the legacy layout for a card of `total_sectors`, packing the
/// redirected windows against the aligned end of the card. `None` when the
/// card is too small to leave room for the boot filesystem.
#[must_use]
pub fn plan_legacy_layout(total_sectors: u32) -> Option<LegacyPlan> {
    let end = total_sectors & 0xFFFF_0000;
    let slccmpt_base = end.checked_sub(REDSLC_SECTORS)?;
    let slc_base = slccmpt_base.checked_sub(REDSLC_SECTORS)?;
    let mlc_base = slc_base.checked_sub(LEGACY_MLC_SECTORS)?;
    let data_base = mlc_base.checked_sub(LEGACY_DATA_SECTORS)?;
    if data_base == 0 {
        return None;
    }
    Some(LegacyPlan {
        data: RedPartition {
            lba_start: data_base,
            lba_length: LEGACY_DATA_SECTORS,
        },
        mlc: RedPartition {
            lba_start: mlc_base,
            lba_length: LEGACY_MLC_SECTORS,
        },
        slc: RedPartition {
            lba_start: slc_base,
            lba_length: 2 * REDSLC_SECTORS,
        },
    })
}

/// Write the plan into partition slots 1..3 as type-0xAE entries. Slot 0
/// is left for the boot filesystem.
pub fn apply_legacy_layout(mbr: &mut Mbr, plan: &LegacyPlan) {
    for (slot, window) in [(1, plan.data), (2, plan.mlc), (3, plan.slc)] {
        mbr.partitions[slot] = PartitionEntry {
            bootable: 0,
            chs_start: [0; 3],
            part_type: PART_TYPE_LEGACY,
            chs_end: [0; 3],
            lba_start: window.lba_start,
            lba_length: window.lba_length,
        };
    }
}

/// One redirected SLC bank: cluster requests turned into sector transfers
/// inside the partition window.
#[derive(Clone)]
pub struct RedNand {
    device: Arc<dyn SectorDevice>,
    partition: RedPartition,
}

impl RedNand {
    /// Bind a partition window on `device`. The window must hold a full
    /// bank and lie inside the device.
    pub fn new(device: Arc<dyn SectorDevice>, partition: RedPartition) -> Result<Self> {
        if !partition.is_present() {
            return Err(MinuteError::Config("partition window is empty".to_owned()));
        }
        if partition.lba_length < REDSLC_SECTORS {
            return Err(MinuteError::Format(format!(
                "partition of {} sectors cannot hold a full bank ({} needed)",
                partition.lba_length, REDSLC_SECTORS
            )));
        }
        let end = partition
            .lba_start
            .checked_add(partition.lba_length)
            .ok_or_else(|| {
                MinuteError::Format("partition window overflows the sector range".to_owned())
            })?;
        if end > device.sector_count() {
            return Err(MinuteError::Format(format!(
                "partition window {}+{} exceeds the card ({} sectors)",
                partition.lba_start,
                partition.lba_length,
                device.sector_count()
            )));
        }
        Ok(Self { device, partition })
    }

    fn sector_of(&self, first: ClusterIndex, buf_len: usize) -> Result<SectorIndex> {
        if buf_len % CLUSTER_SIZE != 0 {
            return Err(MinuteError::Format(format!(
                "cluster buffer is {buf_len} bytes, not a whole number of clusters"
            )));
        }
        let clusters = (buf_len / CLUSTER_SIZE) as u32;
        let last = u32::from(first.0) + clusters;
        if last > u32::from(CLUSTER_COUNT) {
            return Err(MinuteError::Format(format!(
                "cluster span {first}+{clusters} out of range"
            )));
        }
        SectorIndex(self.partition.lba_start)
            .checked_add(first.first_sector().0)
            .ok_or_else(|| {
                MinuteError::Format("cluster window overflows the sector range".to_owned())
            })
    }

    /// Read whole clusters starting at `first`.
    pub fn read_clusters(&self, first: ClusterIndex, buf: &mut [u8]) -> Result<()> {
        let sector = self.sector_of(first, buf.len())?;
        self.device.read_sectors(sector, buf)
    }

    /// Write whole clusters starting at `first`.
    pub fn write_clusters(&self, first: ClusterIndex, buf: &[u8]) -> Result<()> {
        let sector = self.sector_of(first, buf.len())?;
        self.device.write_sectors(sector, buf)
    }
}
