//! Shared fixtures: deterministic keys, formatted superblocks, and a small
//! tree builder that lays files out the way the firmware formatter would.

use std::sync::Arc;

use mnt_crypto::{Otp, OTP_SIZE};
use mnt_nand::{MemNand, NandBank};
use mnt_ondisk::{FstEntry, Superblock, SuperblockHeader};
use mnt_types::{
    encode_nul_padded, ClusterIndex, FatEntry, FstIndex, Generation, SuperSlot, CLUSTER_COUNT,
    CLUSTER_SIZE, SUPER_CLUSTERS, SUPER_MAGIC_V0, SUPER_MAGIC_V1, SUPER_SIZE,
};

use crate::superblock::write_super;
use crate::volume::{Volume, VolumeDevice, VolumeFlags, VolumeId};

/// A deterministic fuse dump with distinct bytes in every key slot.
pub fn test_otp() -> Otp {
    let mut raw = vec![0_u8; OTP_SIZE];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(37).wrapping_add((i >> 8) as u8);
    }
    Otp::from_bytes(&raw).expect("otp fixture")
}

/// Deterministic filler, salted so different buffers never collide.
pub fn patterned(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt))
        .collect()
}

/// A blank in-memory SLC bank wrapped in a keyed volume.
pub fn slc_volume() -> (Arc<MemNand>, Volume) {
    let nand = Arc::new(MemNand::new(NandBank::Slc));
    let mut volume = Volume::new(VolumeId::Slc, VolumeDevice::Nand(nand.clone()));
    volume.load_keys(&test_otp(), 1);
    (nand, volume)
}

/// A freshly formatted superblock: magic and header set, every FAT cell
/// empty except the reserved superblock tail, and a root directory record.
pub fn formatted_superblock(version: u8, super_count: u8, generation: Generation) -> Superblock {
    let mut raw = vec![0_u8; SUPER_SIZE];
    let magic = if version == 0 {
        SUPER_MAGIC_V0
    } else {
        SUPER_MAGIC_V1
    };
    raw[..4].copy_from_slice(&magic);
    let mut superblock = Superblock::from_bytes(raw).expect("superblock fixture");
    superblock
        .set_header(&SuperblockHeader {
            version,
            generation,
            x1: 0,
        })
        .expect("header");

    for cluster in 0..CLUSTER_COUNT {
        superblock
            .set_fat(ClusterIndex(cluster), FatEntry::Empty)
            .expect("fat");
    }
    let reserved = CLUSTER_COUNT - u16::from(super_count) * SUPER_CLUSTERS;
    for cluster in reserved..CLUSTER_COUNT {
        superblock
            .set_fat(ClusterIndex(cluster), FatEntry::Reserved)
            .expect("fat");
    }

    let mut root = FstEntry::zeroed();
    root.name[0] = b'/';
    root.mode = 2;
    root.sub = FstIndex::NONE_RAW;
    root.sib = FstIndex::NONE_RAW;
    superblock.set_fst(FstIndex(0), &root).expect("root");
    superblock
}

/// Builds a populated volume: directories and files go into the superblock
/// and their data onto the media, then `build` commits the superblock to a
/// slot of the caller's choosing.
///
/// New entries hang off the head of their directory's child chain and
/// clusters are handed out sequentially from zero, which tests rely on when
/// they predict iteration order or chain layout.
pub struct FsBuilder {
    nand: Arc<MemNand>,
    volume: Volume,
    superblock: Superblock,
    next_fst: u16,
    next_cluster: u16,
}

impl FsBuilder {
    pub fn new() -> Self {
        let (nand, volume) = slc_volume();
        let superblock = formatted_superblock(1, 64, Generation(40));
        Self {
            nand,
            volume,
            superblock,
            next_fst: 1,
            next_cluster: 0,
        }
    }

    pub fn add_dir(&mut self, parent: FstIndex, name: &str) -> FstIndex {
        let mut entry = FstEntry::zeroed();
        entry.name = encode_nul_padded(name).expect("name");
        entry.mode = 2;
        entry.sub = FstIndex::NONE_RAW;
        self.add_entry(parent, entry)
    }

    pub fn add_file(&mut self, parent: FstIndex, name: &str, data: &[u8]) -> FstIndex {
        let mut entry = FstEntry::zeroed();
        entry.name = encode_nul_padded(name).expect("name");
        entry.mode = 1;
        entry.size = data.len() as u32;

        if data.is_empty() {
            entry.sub = FatEntry::RAW_LAST;
        } else {
            let clusters = data.len().div_ceil(CLUSTER_SIZE);
            let first = self.next_cluster;
            entry.sub = first;
            for i in 0..clusters as u16 {
                let link = if usize::from(i) + 1 == clusters {
                    FatEntry::Last
                } else {
                    FatEntry::Chain(ClusterIndex(first + i + 1))
                };
                self.superblock
                    .set_fat(ClusterIndex(first + i), link)
                    .expect("fat");
            }
            self.next_cluster = first + clusters as u16;

            let mut padded = data.to_vec();
            padded.resize(clusters * CLUSTER_SIZE, 0);
            self.volume
                .write_volume(
                    ClusterIndex(first),
                    VolumeFlags::ENCRYPTED,
                    None,
                    &padded,
                )
                .expect("file data");
        }
        self.add_entry(parent, entry)
    }

    fn add_entry(&mut self, parent: FstIndex, mut entry: FstEntry) -> FstIndex {
        let idx = FstIndex(self.next_fst);
        self.next_fst += 1;
        let mut dir = self.superblock.fst(parent).expect("parent");
        entry.sib = dir.sub;
        dir.sub = idx.0;
        self.superblock.set_fst(parent, &dir).expect("parent");
        self.superblock.set_fst(idx, &entry).expect("entry");
        idx
    }

    pub fn build(self, slot: SuperSlot) -> (Arc<MemNand>, Volume) {
        write_super(&self.volume, slot, &self.superblock).expect("superblock");
        (self.nand, self.volume)
    }
}
