//! The volume registry: one slot per addressable volume, tracking whether
//! it is installed, mounted, or temporarily checked out by a caller.
//!
//! Paths arriving from outside name their volume with a prefix
//! (`slc:/title/...`); [`parse_volume_path`] splits that off and the store
//! routes the remainder to the right [`Filesystem`].

use parking_lot::Mutex;
use tracing::debug;

use mnt_crypto::Otp;
use mnt_error::{MinuteError, Result};

use crate::fs::Filesystem;
use crate::superblock::load_super;
use crate::volume::{Volume, VolumeId};

enum VolumeSlot {
    Empty,
    Unmounted(Volume),
    Mounted(Filesystem),
    /// Parked while a caller holds the filesystem via `checkout`.
    CheckedOut,
}

fn slot_index(id: VolumeId) -> usize {
    match id {
        VolumeId::Slccmpt => 0,
        VolumeId::Slc => 1,
        VolumeId::RedSlccmpt => 2,
        VolumeId::RedSlc => 3,
    }
}

/// Registry of the four volume slots.
pub struct VolumeStore {
    slots: Mutex<[VolumeSlot; 4]>,
}

impl Default for VolumeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([
                VolumeSlot::Empty,
                VolumeSlot::Empty,
                VolumeSlot::Empty,
                VolumeSlot::Empty,
            ]),
        }
    }

    /// Register a volume in its slot, which must be empty.
    pub fn install(&self, volume: Volume) -> Result<()> {
        let id = volume.id();
        let mut slots = self.slots.lock();
        let slot = &mut slots[slot_index(id)];
        match slot {
            VolumeSlot::Empty => {
                *slot = VolumeSlot::Unmounted(volume);
                debug!(volume = %id, "installed");
                Ok(())
            }
            _ => Err(MinuteError::Format(format!(
                "volume {id} is already installed"
            ))),
        }
    }

    /// Mount a registered volume. Mounting a volume that is already
    /// mounted is a no-op.
    pub fn mount(&self, id: VolumeId, otp: &Otp) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[slot_index(id)];
        match std::mem::replace(slot, VolumeSlot::CheckedOut) {
            VolumeSlot::Unmounted(mut volume) => match load_super(&mut volume, otp) {
                Ok(state) => {
                    *slot = VolumeSlot::Mounted(Filesystem::from_parts(volume, state));
                    Ok(())
                }
                Err(err) => {
                    *slot = VolumeSlot::Unmounted(volume);
                    Err(err)
                }
            },
            other @ (VolumeSlot::Mounted(_) | VolumeSlot::CheckedOut) => {
                *slot = other;
                Ok(())
            }
            VolumeSlot::Empty => {
                *slot = VolumeSlot::Empty;
                Err(MinuteError::NotFound {
                    name: id.name().to_string(),
                })
            }
        }
    }

    /// Unmount a volume, dropping its superblock buffer. Unmounting a
    /// volume that is not mounted is a no-op; a checked-out volume cannot
    /// be unmounted until it comes back.
    pub fn unmount(&self, id: VolumeId) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[slot_index(id)];
        match std::mem::replace(slot, VolumeSlot::Empty) {
            VolumeSlot::Mounted(fs) => {
                *slot = VolumeSlot::Unmounted(fs.unmount());
                Ok(())
            }
            VolumeSlot::Unmounted(volume) => {
                *slot = VolumeSlot::Unmounted(volume);
                Ok(())
            }
            VolumeSlot::CheckedOut => {
                *slot = VolumeSlot::CheckedOut;
                Err(MinuteError::Format(format!("volume {id} is checked out")))
            }
            VolumeSlot::Empty => Err(MinuteError::NotFound {
                name: id.name().to_string(),
            }),
        }
    }

    /// Take exclusive ownership of a mounted filesystem; the slot is
    /// parked until [`VolumeStore::check_in`] returns it.
    pub fn checkout(&self, id: VolumeId) -> Result<Filesystem> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[slot_index(id)];
        match std::mem::replace(slot, VolumeSlot::CheckedOut) {
            VolumeSlot::Mounted(fs) => Ok(fs),
            other => {
                *slot = other;
                Err(MinuteError::NotMounted { volume: id.name() })
            }
        }
    }

    /// Return a filesystem taken with [`VolumeStore::checkout`].
    pub fn check_in(&self, fs: Filesystem) -> Result<()> {
        let id = fs.volume().id();
        let mut slots = self.slots.lock();
        let slot = &mut slots[slot_index(id)];
        match slot {
            VolumeSlot::CheckedOut => {
                *slot = VolumeSlot::Mounted(fs);
                Ok(())
            }
            _ => Err(MinuteError::Format(format!(
                "volume {id} was not checked out"
            ))),
        }
    }

    /// Whether the volume is mounted. A checked-out volume counts.
    #[must_use]
    pub fn is_mounted(&self, id: VolumeId) -> bool {
        matches!(
            self.slots.lock()[slot_index(id)],
            VolumeSlot::Mounted(_) | VolumeSlot::CheckedOut
        )
    }

    /// Run `op` against a mounted filesystem. The slot is parked while the
    /// closure runs and restored afterwards whether or not it succeeds.
    pub fn with_filesystem<T>(
        &self,
        id: VolumeId,
        op: impl FnOnce(&mut Filesystem) -> Result<T>,
    ) -> Result<T> {
        let mut fs = self.checkout(id)?;
        let result = op(&mut fs);
        match self.check_in(fs) {
            Ok(()) => result,
            Err(err) => result.and(Err(err)),
        }
    }
}

/// Split `slc:/path/to/file` into the volume and the in-volume remainder,
/// which keeps its leading separator.
pub fn parse_volume_path(path: &str) -> Result<(VolumeId, &str)> {
    let (volume, rest) = path
        .split_once(':')
        .filter(|(_, rest)| rest.starts_with('/'))
        .ok_or_else(|| MinuteError::Format(format!("expected volume:/path, got {path:?}")))?;
    let id = VolumeId::from_name(volume).ok_or_else(|| MinuteError::NotFound {
        name: volume.to_string(),
    })?;
    Ok((id, rest))
}
