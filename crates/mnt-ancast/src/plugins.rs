//! Plugin chain layout below the ramdisk top.
//!
//! Patched IOS kernels discover extra payloads through a singly linked list
//! laid out at the high end of MEM1: an anchor pair ("PLUG" sentinel plus a
//! pointer to the first entry) sits 8 bytes below the ramdisk top, and each
//! plugin carries a chain slot at offset 0x10 pointing to the next entry,
//! with the sentinel word terminating the list. Blobs are placed top-down,
//! word aligned, so the chain can grow without relocating anything.

use mnt_error::{MinuteError, Result};
use mnt_types::{
    MemRegion, MAX_PLUGINS, PLUGIN_CHAIN_OFFSET, PLUGIN_MAGIC_DATA, PLUGIN_MAGIC_ELF,
    PLUGIN_MAGIC_PLUG, RAMDISK_END_ADDR, REGION_CARVEOUT,
};
use tracing::debug;

use crate::arena::Arena;

/// Top-down allocator for plugin blobs plus the chain words linking them.
pub struct PluginChain {
    arena: Arena,
    entries: Vec<u32>,
    anchor: u32,
    top: u32,
}

impl PluginChain {
    /// Chain over the standard carveout below the ramdisk top.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: Arena::new(REGION_CARVEOUT),
            entries: Vec::new(),
            anchor: RAMDISK_END_ADDR - 8,
            top: RAMDISK_END_ADDR - 8,
        }
    }

    /// Chain over an arbitrary window. The window must hold at least the
    /// anchor pair and end on a word boundary.
    pub fn with_window(window: MemRegion) -> Result<Self> {
        let Some(end) = window.end() else {
            return Err(MinuteError::Format(
                "plugin window wraps the address space".into(),
            ));
        };
        if window.len < 8 || end % 4 != 0 {
            return Err(MinuteError::Format(
                "plugin window cannot hold the chain anchor".into(),
            ));
        }
        Ok(Self {
            arena: Arena::new(window),
            entries: Vec::new(),
            anchor: end - 8,
            top: end - 8,
        })
    }

    /// Entry addresses in push order.
    #[must_use]
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Stage one blob below the previous one and record its entry address.
    ///
    /// The blob must open with an ELF or DATA magic word and be large enough
    /// to carry the chain slot at offset 0x10.
    pub fn push(&mut self, blob: &[u8]) -> Result<u32> {
        if self.entries.len() >= MAX_PLUGINS {
            return Err(MinuteError::Format(format!(
                "plugin chain is full ({MAX_PLUGINS} entries)"
            )));
        }
        if blob.len() < PLUGIN_CHAIN_OFFSET + 4 {
            return Err(MinuteError::Format(format!(
                "plugin blob of {:#x} bytes cannot hold a chain slot",
                blob.len()
            )));
        }
        let magic = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
        if magic != PLUGIN_MAGIC_ELF && magic != PLUGIN_MAGIC_DATA {
            return Err(MinuteError::Format(format!(
                "plugin blob magic {magic:#010x} is neither ELF nor DATA"
            )));
        }

        let span = u32::try_from((blob.len() + 3) & !3).map_err(|_| {
            MinuteError::Format("plugin blob larger than the address space".into())
        })?;
        let base = self
            .top
            .checked_sub(span)
            .filter(|base| *base >= self.arena.region().base);
        let Some(base) = base else {
            return Err(MinuteError::Format(format!(
                "plugin window exhausted after {} entries",
                self.entries.len()
            )));
        };

        self.arena.slice_mut(base, blob.len())?.copy_from_slice(blob);
        debug!(base, len = blob.len(), index = self.entries.len(), "plugin staged");
        self.entries.push(base);
        self.top = base;
        Ok(base)
    }

    /// Link the staged blobs and write the anchor pair.
    ///
    /// An empty chain leaves the window zeroed so the kernel sees no anchor
    /// at all.
    pub fn finalize(mut self) -> Result<Arena> {
        if self.entries.is_empty() {
            return Ok(self.arena);
        }
        for i in 1..self.entries.len() {
            self.write_chain_slot(self.entries[i - 1], self.entries[i])?;
        }
        let last = self.entries[self.entries.len() - 1];
        self.write_chain_slot(last, PLUGIN_MAGIC_PLUG)?;

        self.arena.write_word(self.anchor, PLUGIN_MAGIC_PLUG)?;
        self.arena.write_word(self.anchor + 4, self.entries[0])?;
        debug!(
            count = self.entries.len(),
            first = self.entries[0],
            "plugin chain sealed"
        );
        Ok(self.arena)
    }

    fn write_chain_slot(&mut self, entry: u32, value: u32) -> Result<()> {
        self.arena
            .write_word(entry + PLUGIN_CHAIN_OFFSET as u32, value)
    }
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::new()
    }
}
