//! File and directory access over a mounted volume.
//!
//! A [`Filesystem`] pairs a [`Volume`] with the superblock its mount scan
//! settled on. Paths are volume-relative (`title/sub/file`); the volume
//! prefix is the store's business. Handles hold FST indices rather than
//! record copies, so every operation re-reads the live record and a handle
//! left open across an unlink simply sees the zeroed record.
//!
//! The root directory has no name of its own and cannot be reached through
//! a path; [`Filesystem::diropen_root`] covers it.

use std::io::SeekFrom;

use mnt_crypto::Otp;
use mnt_error::{MinuteError, Result};
use mnt_ondisk::{FstEntry, Superblock};
use mnt_types::{ClusterIndex, FatEntry, FstIndex, CLUSTER_COUNT, CLUSTER_SIZE};
use tracing::debug;

use crate::superblock::{commit_super, load_super, MountState};
use crate::volume::{Volume, VolumeFlags};

/// An open file: position plus the chain cluster that position falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    fst: FstIndex,
    /// Raw chain value for the current cluster. Holds an end-of-chain
    /// sentinel when the offset sits exactly on the file end.
    cluster: u16,
    offset: u32,
}

impl FileHandle {
    /// FST record the handle was opened on.
    #[must_use]
    pub fn fst(&self) -> FstIndex {
        self.fst
    }

    /// Current byte offset.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// A directory iteration cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHandle {
    dir: FstIndex,
    child: Option<FstIndex>,
}

impl DirHandle {
    /// FST record of the directory being iterated.
    #[must_use]
    pub fn dir(&self) -> FstIndex {
        self.dir
    }
}

/// The link through which a resolved record is reachable: its directory's
/// child pointer, or the previous sibling's chain pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentLink {
    Sub(FstIndex),
    Sib(FstIndex),
}

/// A mounted ISFS volume.
pub struct Filesystem {
    volume: Volume,
    state: MountState,
}

impl Filesystem {
    /// Mount `volume`: scan, verify, and buffer its newest superblock.
    pub fn mount(mut volume: Volume, otp: &Otp) -> Result<Self> {
        let state = load_super(&mut volume, otp)?;
        Ok(Self { volume, state })
    }

    pub(crate) fn from_parts(volume: Volume, state: MountState) -> Self {
        Self { volume, state }
    }

    /// Drop the mount and hand the volume back.
    #[must_use]
    pub fn unmount(self) -> Volume {
        self.volume
    }

    #[must_use]
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    #[must_use]
    pub fn state(&self) -> &MountState {
        &self.state
    }

    /// The buffered superblock.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.state.superblock
    }

    /// Look up a path and return its record.
    pub fn stat(&self, path: &str) -> Result<FstEntry> {
        Ok(self.resolve(path)?.1)
    }

    /// The root directory record.
    pub fn root(&self) -> Result<FstEntry> {
        Ok(self.state.superblock.fst_root()?)
    }

    /// Open a file for reading.
    pub fn open(&self, path: &str) -> Result<FileHandle> {
        let (idx, entry, _) = self.resolve(path)?;
        if !entry.is_file() {
            return Err(MinuteError::NotAFile {
                name: path.to_string(),
            });
        }
        Ok(FileHandle {
            fst: idx,
            cluster: entry.sub,
            offset: 0,
        })
    }

    /// Size in bytes of an open file, from the live record.
    pub fn file_size(&self, handle: &FileHandle) -> Result<u32> {
        Ok(self.state.superblock.fst(handle.fst)?.size)
    }

    /// Move the read position. The target must land inside `[0, size]`;
    /// seeking relative to the end therefore only accepts offsets in
    /// `[-size, 0]`. Returns the new position.
    pub fn seek(&self, handle: &mut FileHandle, pos: SeekFrom) -> Result<u32> {
        let entry = self.state.superblock.fst(handle.fst)?;
        let size = entry.size;
        let target = match pos {
            SeekFrom::Start(offset) => match u32::try_from(offset) {
                Ok(offset) if offset <= size => offset,
                _ => {
                    return Err(MinuteError::Format(format!(
                        "seek target {offset} outside file of {size} bytes"
                    )))
                }
            },
            SeekFrom::Current(delta) => seek_target(handle.offset, delta, size)?,
            SeekFrom::End(delta) => seek_target(size, delta, size)?,
        };

        // Walk the chain to the cluster holding the target offset. A target
        // on the file end walks one step past the last cluster and parks on
        // the chain sentinel, which reads never dereference.
        let mut cluster = entry.sub;
        let mut left = target as usize;
        while left >= CLUSTER_SIZE {
            cluster = self.next_cluster(cluster)?;
            left -= CLUSTER_SIZE;
        }
        handle.cluster = cluster;
        handle.offset = target;
        Ok(target)
    }

    /// Read from the current position, advancing it. Returns the number of
    /// bytes read, short only at the file end.
    pub fn read(&self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        let entry = self.state.superblock.fst(handle.fst)?;
        let available = entry.size.saturating_sub(handle.offset) as usize;
        let total = buf.len().min(available);

        let mut done = 0;
        let mut scratch = vec![0_u8; CLUSTER_SIZE];
        while done < total {
            let pos = handle.offset as usize % CLUSTER_SIZE;
            let copy = (CLUSTER_SIZE - pos).min(total - done);
            if handle.cluster >= CLUSTER_COUNT {
                return Err(chain_ends_early(handle.cluster));
            }
            // File data is encrypted but not HMAC-checked; the filesystem
            // digest only covers metadata writes.
            self.volume.read_volume(
                ClusterIndex(handle.cluster),
                VolumeFlags::ENCRYPTED,
                None,
                &mut scratch,
            )?;
            buf[done..done + copy].copy_from_slice(&scratch[pos..pos + copy]);
            handle.offset += copy as u32;
            done += copy;
            if pos + copy >= CLUSTER_SIZE {
                handle.cluster = self.next_cluster(handle.cluster)?;
            }
        }
        Ok(total)
    }

    /// Open a directory for iteration. An empty directory yields a cursor
    /// that is exhausted from the start.
    pub fn diropen(&self, path: &str) -> Result<DirHandle> {
        let (idx, entry, _) = self.resolve(path)?;
        if !entry.is_directory() {
            return Err(MinuteError::NotADirectory {
                name: path.to_string(),
            });
        }
        Ok(DirHandle {
            dir: idx,
            child: entry.first_child(),
        })
    }

    /// Cursor over the root directory's children.
    pub fn diropen_root(&self) -> Result<DirHandle> {
        let root = self.state.superblock.fst_root()?;
        Ok(DirHandle {
            dir: FstIndex(0),
            child: root.first_child(),
        })
    }

    /// Next directory entry, or `None` once exhausted.
    pub fn dirread(&self, dir: &mut DirHandle) -> Result<Option<(FstIndex, FstEntry)>> {
        let Some(idx) = dir.child else {
            return Ok(None);
        };
        let entry = self.state.superblock.fst(idx)?;
        dir.child = entry.next_sibling();
        Ok(Some((idx, entry)))
    }

    /// Rewind the cursor to the directory's first entry, re-reading the
    /// live record.
    pub fn dirreset(&self, dir: &mut DirHandle) -> Result<()> {
        let entry = self.state.superblock.fst(dir.dir)?;
        dir.child = entry.first_child();
        Ok(())
    }

    /// Remove a file: splice it out of its directory, free its cluster
    /// chain, zero its record, and commit the superblock.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (idx, entry, link) = self.resolve(path)?;
        if !entry.is_file() {
            return Err(MinuteError::NotAFile {
                name: path.to_string(),
            });
        }

        let superblock = &mut self.state.superblock;
        match link {
            ParentLink::Sub(dir) => {
                let mut parent = superblock.fst(dir)?;
                parent.sub = entry.sib;
                superblock.set_fst(dir, &parent)?;
            }
            ParentLink::Sib(prev) => {
                let mut prev_entry = superblock.fst(prev)?;
                prev_entry.sib = entry.sib;
                superblock.set_fst(prev, &prev_entry)?;
            }
        }

        let mut cluster = entry.sub;
        while cluster < FatEntry::RAW_LAST {
            let next = superblock.fat(ClusterIndex(cluster))?.to_raw();
            superblock.set_fat(ClusterIndex(cluster), FatEntry::Empty)?;
            cluster = next;
        }

        superblock.set_fst(idx, &FstEntry::zeroed())?;

        let slot = commit_super(&self.volume, &mut self.state)?;
        debug!(volume = %self.volume.id(), path, %slot, "unlinked");
        Ok(())
    }

    /// Walk `path` component by component, mirroring the firmware walk:
    /// separators collapse, a file whose name matches a non-final component
    /// is skipped rather than descended into, and a trailing separator asks
    /// for an empty name inside the final directory (which real trees never
    /// carry). The returned link is the pointer through which the record
    /// hangs in its directory.
    fn resolve(&self, path: &str) -> Result<(FstIndex, FstEntry, ParentLink)> {
        let superblock = &self.state.superblock;
        let root = superblock.fst_root()?;
        let mut link = ParentLink::Sub(FstIndex(0));
        let mut next = root.first_child();
        let mut rest = path;

        loop {
            let Some(mut idx) = next else {
                return Err(MinuteError::NotFound {
                    name: path.to_string(),
                });
            };
            rest = rest.trim_start_matches('/');
            let (component, remaining) = match rest.find('/') {
                Some(at) => (&rest[..at], Some(&rest[at..])),
                None => (rest, None),
            };

            let mut entry = superblock.fst(idx)?;
            while (remaining.is_some() && entry.is_file()) || !entry.name_matches(component) {
                let Some(sib) = entry.next_sibling() else {
                    return Err(MinuteError::NotFound {
                        name: path.to_string(),
                    });
                };
                link = ParentLink::Sib(idx);
                idx = sib;
                entry = superblock.fst(idx)?;
            }

            match remaining {
                None => return Ok((idx, entry, link)),
                Some(further) => {
                    link = ParentLink::Sub(idx);
                    next = entry.first_child();
                    rest = further;
                }
            }
        }
    }

    /// Follow the FAT one step from a raw chain value.
    fn next_cluster(&self, cluster: u16) -> Result<u16> {
        if cluster >= CLUSTER_COUNT {
            return Err(chain_ends_early(cluster));
        }
        Ok(self.state.superblock.fat(ClusterIndex(cluster))?.to_raw())
    }
}

fn chain_ends_early(cluster: u16) -> MinuteError {
    MinuteError::Format(format!("cluster chain ends early at {cluster:#x}"))
}

fn seek_out_of_range(target: i64, size: u32) -> MinuteError {
    MinuteError::Format(format!("seek target {target} outside file of {size} bytes"))
}

fn seek_target(base: u32, delta: i64, size: u32) -> Result<u32> {
    let target = i64::from(base) + delta;
    if target < 0 || target > i64::from(size) {
        return Err(seek_out_of_range(target, size));
    }
    Ok(target as u32)
}
