//! Test rig: in-memory SLC volumes carrying a four-copy install.

use std::sync::Arc;

use mnt_crypto::{Otp, OTP_SIZE};
use mnt_isfs::{write_super, Volume, VolumeDevice, VolumeId};
use mnt_nand::{MemNand, NandBank};
use mnt_ondisk::{slot_cluster, FstEntry, IsfshaxInfo, IsfshaxSlot, Superblock, SuperblockHeader};
use mnt_types::{
    ClusterIndex, FatEntry, FstIndex, Generation, PageIndex, SuperSlot, CLUSTER_COUNT,
    CLUSTER_PAGES, ISFSHAX_GENERATION_FIRST, ISFSHAX_REDUNDANCY, SUPER_CLUSTERS, SUPER_MAGIC_V1,
    SUPER_SIZE,
};

/// Physical slots the fixture install occupies, top of the SLC ring.
pub const INSTALL_SLOTS: [u8; ISFSHAX_REDUNDANCY] = [60, 61, 62, 63];

const SLC_SUPER_COUNT: u8 = 64;

pub fn test_otp() -> Otp {
    let mut raw = vec![0_u8; OTP_SIZE];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(37).wrapping_add((i >> 8) as u8);
    }
    Otp::from_bytes(&raw).expect("otp fixture")
}

pub fn default_slots() -> [IsfshaxSlot; ISFSHAX_REDUNDANCY] {
    INSTALL_SLOTS.map(|slot| IsfshaxSlot {
        bad: false,
        ecc_correctable: false,
        slot,
    })
}

/// A volume with an install laid down, plus the info block boot would use.
pub struct InstallRig {
    pub nand: Arc<MemNand>,
    pub volume: Volume,
    pub info: IsfshaxInfo,
}

/// Install a copy at every non-bad position: position `p` gets generation
/// `generations[p]` and an info block claiming index `p`. The returned
/// info is the one at `index`, which tests treat as the booted copy.
pub fn install_with_slots(
    slots: [IsfshaxSlot; ISFSHAX_REDUNDANCY],
    generations: [u32; ISFSHAX_REDUNDANCY],
    index: u32,
) -> InstallRig {
    let nand = Arc::new(MemNand::new(NandBank::Slc));
    let mut volume = Volume::new(VolumeId::Slc, VolumeDevice::Nand(nand.clone()));
    volume.load_keys(&test_otp(), 1);

    for (position, slot) in slots.iter().enumerate() {
        if slot.bad {
            continue;
        }
        let mut superblock = base_superblock(generations[position]);
        let info = IsfshaxInfo {
            slots,
            generation: Generation(generations[position]),
            generation_base: Generation(ISFSHAX_GENERATION_FIRST),
            index: position as u32,
        };
        superblock.set_isfshax_info(&info).expect("info");
        write_super(&volume, slot.super_slot(), &superblock).expect("install copy");
    }

    let info = IsfshaxInfo {
        slots,
        generation: Generation(generations[index as usize]),
        generation_base: Generation(ISFSHAX_GENERATION_FIRST),
        index,
    };
    InstallRig { nand, volume, info }
}

pub fn install(generations: [u32; ISFSHAX_REDUNDANCY], index: u32) -> InstallRig {
    install_with_slots(default_slots(), generations, index)
}

/// First page of a superblock slot's span.
pub fn slot_page(slot: SuperSlot) -> PageIndex {
    slot_cluster(SLC_SUPER_COUNT, slot)
        .expect("slot in range")
        .first_page()
}

/// One flipped data bit: the next verified read corrects it.
pub fn damage_one_bit(nand: &MemNand, slot: SuperSlot) {
    nand.flip_data_bit(slot_page(slot), 300, 2);
}

/// Two flipped bits in one ECC subblock: the next verified read fails.
pub fn damage_two_bits(nand: &MemNand, slot: SuperSlot) {
    let page = slot_page(slot);
    nand.flip_data_bit(page, 10, 1);
    nand.flip_data_bit(page, 11, 2);
}

/// Corrupt one of the two spare HMAC copies. The copies that count live in
/// the span's last cluster, so the flip goes there; the next verified read
/// comes back degraded but usable.
pub fn damage_hmac_copy(nand: &MemNand, slot: SuperSlot) {
    let last_cluster_page6 =
        slot_page(slot).0 + (u32::from(SUPER_CLUSTERS) - 1) * CLUSTER_PAGES + 6;
    nand.flip_spare_bit(PageIndex(last_cluster_page6), 2, 0);
}

/// A formatted v1 superblock: empty FAT with the reserved tail, the
/// install's slots marked bad in the FAT, and a root record.
fn base_superblock(generation: u32) -> Superblock {
    let mut raw = vec![0_u8; SUPER_SIZE];
    raw[..4].copy_from_slice(&SUPER_MAGIC_V1);
    let mut superblock = Superblock::from_bytes(raw).expect("superblock fixture");
    superblock
        .set_header(&SuperblockHeader {
            version: 1,
            generation: Generation(generation),
            x1: 0,
        })
        .expect("header");

    for cluster in 0..CLUSTER_COUNT {
        superblock
            .set_fat(ClusterIndex(cluster), FatEntry::Empty)
            .expect("fat");
    }
    let reserved = CLUSTER_COUNT - u16::from(SLC_SUPER_COUNT) * SUPER_CLUSTERS;
    for cluster in reserved..CLUSTER_COUNT {
        superblock
            .set_fat(ClusterIndex(cluster), FatEntry::Reserved)
            .expect("fat");
    }
    // The install claims its slots as bad clusters so the normal
    // filesystem never allocates or commits over them.
    for slot in INSTALL_SLOTS {
        let first = slot_cluster(SLC_SUPER_COUNT, SuperSlot(slot)).expect("slot in range");
        for c in 0..SUPER_CLUSTERS {
            superblock
                .set_fat(ClusterIndex(first.0 + c), FatEntry::Bad)
                .expect("fat");
        }
    }

    let mut root = FstEntry::zeroed();
    root.name[0] = b'/';
    root.mode = 2;
    root.sub = FstIndex::NONE_RAW;
    root.sib = FstIndex::NONE_RAW;
    superblock.set_fst(FstIndex(0), &root).expect("root");
    superblock
}
