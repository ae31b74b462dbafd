//! Deterministic media builders shared by the scenario runners and the
//! integration tests: fuse dumps, signed firmware images, formatted SLC
//! volumes, and recovery-ring installs.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use mnt_crypto::{
    encrypt_cbc, sha1, Otp, ANCAST_IV, OTP_SECURITY_LEVEL_OFFSET, OTP_SIZE,
};
use mnt_isfs::{write_super, Volume, VolumeDevice, VolumeFlags, VolumeId};
use mnt_nand::{MemNand, NandBank};
use mnt_ondisk::{
    slot_cluster, AncastHeader, FstEntry, IosHeader, IsfshaxInfo, IsfshaxSlot, Superblock,
    SuperblockHeader,
};
use mnt_types::{
    encode_nul_padded, ClusterIndex, FatEntry, FstIndex, Generation, PageIndex, SuperSlot,
    ANCAST_HEADER_OFFSET_SIG1, ANCAST_HEADER_OFFSET_SIG2, CLUSTER_COUNT, CLUSTER_PAGES,
    CLUSTER_SIZE, ISFSHAX_GENERATION_FIRST, ISFSHAX_REDUNDANCY, SUPER_CLUSTERS, SUPER_MAGIC_V0,
    SUPER_MAGIC_V1, SUPER_SIZE,
};

/// Slot count of the SLC superblock ring every builder here formats for.
pub const SLC_SUPER_COUNT: u8 = 64;

/// Physical slots a recovery install occupies, top of the SLC ring.
pub const RECOVERY_SLOTS: [u8; ISFSHAX_REDUNDANCY] = [60, 61, 62, 63];

fn patterned_otp() -> Vec<u8> {
    let mut raw = vec![0_u8; OTP_SIZE];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(73).wrapping_add((i >> 8) as u8);
    }
    raw
}

/// A deterministic fuse dump for an unfused console: distinct bytes in
/// every key slot, security word zeroed so the persistent window stays
/// plaintext.
pub fn test_otp() -> Result<Otp> {
    let mut raw = patterned_otp();
    raw[OTP_SECURITY_LEVEL_OFFSET..OTP_SECURITY_LEVEL_OFFSET + 4].fill(0);
    Otp::from_bytes(&raw).context("fuse dump fixture")
}

/// The same dump for a fused console: the security bit that ciphers the
/// persistent window between boot stages is set.
pub fn fused_otp() -> Result<Otp> {
    let mut raw = patterned_otp();
    raw[OTP_SECURITY_LEVEL_OFFSET..OTP_SECURITY_LEVEL_OFFSET + 4].fill(0);
    raw[OTP_SECURITY_LEVEL_OFFSET] = 0x80;
    Otp::from_bytes(&raw).context("fuse dump fixture")
}

/// Deterministic filler, salted so different buffers never collide.
#[must_use]
pub fn patterned(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(29).wrapping_add(salt))
        .collect()
}

/// A blank in-memory SLC bank wrapped in a volume keyed from `otp`.
#[must_use]
pub fn keyed_slc(otp: &Otp) -> (Arc<MemNand>, Volume) {
    let nand = Arc::new(MemNand::new(NandBank::Slc));
    let mut volume = Volume::new(VolumeId::Slc, VolumeDevice::Nand(nand.clone()));
    volume.load_keys(otp, 1);
    (nand, volume)
}

/// A freshly formatted superblock: magic and header set, every FAT cell
/// empty except the reserved slot tail, and a root directory record.
pub fn formatted_superblock(
    version: u8,
    super_count: u8,
    generation: Generation,
) -> Result<Superblock> {
    let mut raw = vec![0_u8; SUPER_SIZE];
    let magic = if version == 0 {
        SUPER_MAGIC_V0
    } else {
        SUPER_MAGIC_V1
    };
    raw[..4].copy_from_slice(&magic);
    let mut superblock = Superblock::from_bytes(raw)?;
    superblock.set_header(&SuperblockHeader {
        version,
        generation,
        x1: 0,
    })?;

    let reserved = CLUSTER_COUNT - u16::from(super_count) * SUPER_CLUSTERS;
    for cluster in 0..CLUSTER_COUNT {
        let entry = if cluster >= reserved {
            FatEntry::Reserved
        } else {
            FatEntry::Empty
        };
        superblock.set_fat(ClusterIndex(cluster), entry)?;
    }

    let mut root = FstEntry::zeroed();
    root.name[0] = b'/';
    root.mode = 2;
    root.sub = FstIndex::NONE_RAW;
    root.sib = FstIndex::NONE_RAW;
    superblock.set_fst(FstIndex(0), &root)?;
    Ok(superblock)
}

// ── Directory tree builder ──────────────────────────────────────────────────

/// Populates a formatted volume the way the firmware formatter lays trees
/// out: new entries hang off the head of their directory's child chain and
/// data clusters are handed out sequentially from zero. Tests that predict
/// iteration order or chain layout rely on both.
pub struct TreeBuilder {
    nand: Arc<MemNand>,
    volume: Volume,
    superblock: Superblock,
    next_record: u16,
    next_cluster: u16,
}

impl TreeBuilder {
    /// A formatted 64-slot v1 volume keyed from `otp`.
    pub fn new(otp: &Otp, generation: Generation) -> Result<Self> {
        let (nand, volume) = keyed_slc(otp);
        let superblock = formatted_superblock(1, SLC_SUPER_COUNT, generation)?;
        Ok(Self {
            nand,
            volume,
            superblock,
            next_record: 1,
            next_cluster: 0,
        })
    }

    /// Root directory record, the parent for top-level entries.
    #[must_use]
    pub fn root(&self) -> FstIndex {
        FstIndex(0)
    }

    pub fn add_dir(&mut self, parent: FstIndex, name: &str) -> Result<FstIndex> {
        let mut entry = FstEntry::zeroed();
        entry.name = encode_nul_padded(name)?;
        entry.mode = 2;
        entry.sub = FstIndex::NONE_RAW;
        self.link_entry(parent, entry)
    }

    pub fn add_file(&mut self, parent: FstIndex, name: &str, data: &[u8]) -> Result<FstIndex> {
        let mut entry = FstEntry::zeroed();
        entry.name = encode_nul_padded(name)?;
        entry.mode = 1;
        entry.size = u32::try_from(data.len()).context("file too large for a 32-bit size")?;

        if data.is_empty() {
            entry.sub = FatEntry::RAW_LAST;
        } else {
            let clusters = u16::try_from(data.len().div_ceil(CLUSTER_SIZE))
                .context("file does not fit the cluster space")?;
            let first = self.next_cluster;
            entry.sub = first;
            for i in 0..clusters {
                let link = if i + 1 == clusters {
                    FatEntry::Last
                } else {
                    FatEntry::Chain(ClusterIndex(first + i + 1))
                };
                self.superblock.set_fat(ClusterIndex(first + i), link)?;
            }
            self.next_cluster = first + clusters;

            let mut padded = data.to_vec();
            padded.resize(usize::from(clusters) * CLUSTER_SIZE, 0);
            // File data goes out encrypted without the metadata HMAC, the
            // way the firmware writes it.
            self.volume
                .write_volume(ClusterIndex(first), VolumeFlags::ENCRYPTED, None, &padded)?;
        }
        self.link_entry(parent, entry)
    }

    fn link_entry(&mut self, parent: FstIndex, mut entry: FstEntry) -> Result<FstIndex> {
        let index = FstIndex(self.next_record);
        self.next_record += 1;
        let mut dir = self.superblock.fst(parent)?;
        entry.sib = dir.sub;
        dir.sub = index.0;
        self.superblock.set_fst(parent, &dir)?;
        self.superblock.set_fst(index, &entry)?;
        Ok(index)
    }

    /// Commit the superblock to `slot` and hand the media back.
    pub fn build(self, slot: SuperSlot) -> Result<(Arc<MemNand>, Volume)> {
        write_super(&self.volume, slot, &self.superblock)?;
        Ok((self.nand, self.volume))
    }
}

// ── Signed firmware images ──────────────────────────────────────────────────

/// Assemble a well-formed signed image around `body`: header framing for
/// the given signature type, body hash over the stored bytes, and the
/// aligned body prefix ciphered with the console firmware key when
/// `encrypted`.
pub fn ancast_image(
    otp: &Otp,
    device: u32,
    sig_type: u32,
    body: &[u8],
    encrypted: bool,
) -> Result<Vec<u8>> {
    let header_offset = match sig_type {
        0x01 => ANCAST_HEADER_OFFSET_SIG1,
        _ => ANCAST_HEADER_OFFSET_SIG2,
    };
    let mut stored = body.to_vec();
    if encrypted {
        let aligned = stored.len() & !0xF;
        encrypt_cbc(&otp.fw_ancast_key(), &ANCAST_IV, &mut stored[..aligned])?;
    }

    let header = AncastHeader {
        sig_offset: 0x20,
        sig_type,
        header_offset,
        unk1: u16::from(!encrypted),
        unk2: 0,
        unk3: 0,
        device,
        image_type: 0x02,
        body_size: u32::try_from(stored.len()).context("body too large for the size field")?,
        body_hash: sha1(&stored),
        version: 0x5101,
    };

    let mut image = vec![0_u8; header.header_size() + stored.len()];
    header.write_to(&mut image)?;
    image[header.header_size()..].copy_from_slice(&stored);
    Ok(image)
}

/// Body with an IOS mini-header pointing `entry_offset` past the body
/// start, padded with a recognizable fill.
pub fn iop_body(len: usize, entry_offset: u32) -> Result<Vec<u8>> {
    if len < IosHeader::SIZE {
        bail!("body of {len} bytes cannot carry the IOS mini-header");
    }
    let mut body = vec![0xC3_u8; len];
    IosHeader {
        header_size: entry_offset,
        loader_size: 0x100,
        elf_size: 0x200,
        ddr_init: 0,
    }
    .write_to(&mut body)?;
    Ok(body)
}

// ── Recovery installs ───────────────────────────────────────────────────────

/// A healthy four-slot ring over [`RECOVERY_SLOTS`].
#[must_use]
pub fn recovery_ring() -> [IsfshaxSlot; ISFSHAX_REDUNDANCY] {
    RECOVERY_SLOTS.map(|slot| IsfshaxSlot {
        bad: false,
        ecc_correctable: false,
        slot,
    })
}

/// A volume with a recovery install laid down, plus the info block boot
/// would carry for it.
pub struct RecoveryInstall {
    pub nand: Arc<MemNand>,
    pub volume: Volume,
    pub info: IsfshaxInfo,
}

/// Install a copy at every non-bad ring position: position `p` gets
/// generation `generations[p]` and an info block claiming index `p`. The
/// returned info is the one at `index`, which scenarios treat as the
/// booted copy.
pub fn install_recovery(
    otp: &Otp,
    slots: [IsfshaxSlot; ISFSHAX_REDUNDANCY],
    generations: [u32; ISFSHAX_REDUNDANCY],
    index: u32,
) -> Result<RecoveryInstall> {
    let (nand, volume) = keyed_slc(otp);

    for (position, slot) in slots.iter().enumerate() {
        if slot.bad {
            continue;
        }
        let generation = Generation(generations[position]);
        let mut superblock = formatted_superblock(1, SLC_SUPER_COUNT, generation)?;
        // The install claims its slots as bad clusters so the normal
        // filesystem never allocates or commits over them.
        for claimed in slots {
            let first = slot_cluster(SLC_SUPER_COUNT, claimed.super_slot())
                .context("ring slot out of range")?;
            for c in 0..SUPER_CLUSTERS {
                superblock.set_fat(ClusterIndex(first.0 + c), FatEntry::Bad)?;
            }
        }
        superblock.set_isfshax_info(&IsfshaxInfo {
            slots,
            generation,
            generation_base: Generation(ISFSHAX_GENERATION_FIRST),
            index: position as u32,
        })?;
        write_super(&volume, slot.super_slot(), &superblock)?;
    }

    let info = IsfshaxInfo {
        slots,
        generation: Generation(generations[index as usize]),
        generation_base: Generation(ISFSHAX_GENERATION_FIRST),
        index,
    };
    Ok(RecoveryInstall { nand, volume, info })
}

// ── Wear injection ──────────────────────────────────────────────────────────

/// First page of a superblock slot's span on the 64-slot ring.
pub fn slot_first_page(slot: SuperSlot) -> Result<PageIndex> {
    let cluster = slot_cluster(SLC_SUPER_COUNT, slot).context("slot out of range")?;
    Ok(cluster.first_page())
}

/// One flipped data bit: the next verified read corrects it.
pub fn flip_correctable_bit(nand: &MemNand, slot: SuperSlot) -> Result<()> {
    nand.flip_data_bit(slot_first_page(slot)?, 300, 2);
    Ok(())
}

/// Two flipped bits in one ECC subblock: the next verified read fails.
pub fn flip_uncorrectable_bits(nand: &MemNand, slot: SuperSlot) -> Result<()> {
    let page = slot_first_page(slot)?;
    nand.flip_data_bit(page, 10, 1);
    nand.flip_data_bit(page, 11, 2);
    Ok(())
}

/// Corrupt one of the two spare HMAC copies. The copies that count live in
/// the span's last cluster, so the flip goes there; the next verified read
/// comes back degraded but usable.
pub fn tear_hmac_copy(nand: &MemNand, slot: SuperSlot) -> Result<()> {
    let page = slot_first_page(slot)?.0 + (u32::from(SUPER_CLUSTERS) - 1) * CLUSTER_PAGES + 6;
    nand.flip_spare_bit(PageIndex(page), 2, 0);
    Ok(())
}
