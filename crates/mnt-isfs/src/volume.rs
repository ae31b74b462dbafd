//! Cluster I/O for ISFS volumes: AES-CBC transparency, spare-area HMAC
//! handling, and whole-block staging for NAND writes.
//!
//! A [`Volume`] binds one mountable filesystem instance to its backing
//! device and key material. NAND-backed volumes move data through the ECC
//! engine page by page and carry the filesystem HMAC in the spare areas of
//! pages 6 and 7 of every cluster; SD-redirected volumes are plain sector
//! windows with no spare areas, so the HMAC flag has nothing to check there
//! and is ignored.
//!
//! Each cluster is an independent AES-CBC unit with a zero IV, which is what
//! lets single clusters be read out of the middle of a file chain.

use std::sync::Arc;

use mnt_crypto::{hmac_sha1, AesCbc, Otp, AES_KEY_LEN, HMAC_KEY_LEN};
use mnt_error::{MinuteError, Result};
use mnt_nand::{correct_page, program_page_ecc, EccStatus, NandBank, NandDevice, RedNand};
use mnt_ondisk::FstEntry;
use mnt_types::{
    ClusterIndex, FstIndex, PageIndex, BLOCK_CLUSTERS, BLOCK_PAGES, CLUSTER_COUNT, CLUSTER_PAGES,
    CLUSTER_SIZE, HMAC_LEN, HMAC_SEED_CLUSTER_OFFSET, HMAC_SEED_SIZE, PAGE_SIZE, PAGE_SPARE_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The four mountable volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeId {
    /// Wii U native SLC bank.
    Slc,
    /// Wii-compat SLC bank.
    Slccmpt,
    /// SLC redirected to an SD partition.
    RedSlc,
    /// SLC-compat redirected to an SD partition.
    RedSlccmpt,
}

impl VolumeId {
    /// Mount-prefix name, as used in `name:/path` addressing.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Slc => "slc",
            Self::Slccmpt => "slccmpt",
            Self::RedSlc => "redslc",
            Self::RedSlccmpt => "redslccmpt",
        }
    }

    /// Inverse of [`VolumeId::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "slc" => Some(Self::Slc),
            "slccmpt" => Some(Self::Slccmpt),
            "redslc" => Some(Self::RedSlc),
            "redslccmpt" => Some(Self::RedSlccmpt),
            _ => None,
        }
    }

    /// True for the SD-redirected volumes.
    #[must_use]
    pub fn is_red(self) -> bool {
        matches!(self, Self::RedSlc | Self::RedSlccmpt)
    }

    /// Number of superblock slots reserved at the top of the volume.
    #[must_use]
    pub fn super_count(self) -> u8 {
        match self {
            Self::Slc | Self::RedSlc => 64,
            Self::Slccmpt | Self::RedSlccmpt => 16,
        }
    }

    /// The physical bank this volume's layout belongs to.
    #[must_use]
    pub fn bank(self) -> NandBank {
        match self {
            Self::Slc | Self::RedSlc => NandBank::Slc,
            Self::Slccmpt | Self::RedSlccmpt => NandBank::Slccmpt,
        }
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Backing storage for a volume.
#[derive(Clone)]
pub enum VolumeDevice {
    /// A raw SLC bank, addressed page by page.
    Nand(Arc<dyn NandDevice>),
    /// A partition window on an SD card, addressed cluster by cluster.
    Red(RedNand),
}

/// Per-request treatment of cluster data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    /// Verify (reads) or place (writes) the spare-area HMAC.
    pub hmac: bool,
    /// Run each cluster through AES-CBC.
    pub encrypted: bool,
    /// Re-read and compare every page after programming.
    pub readback: bool,
}

impl VolumeFlags {
    pub const NONE: Self = Self {
        hmac: false,
        encrypted: false,
        readback: false,
    };
    pub const ENCRYPTED: Self = Self {
        hmac: false,
        encrypted: true,
        readback: false,
    };
    pub const HMAC: Self = Self {
        hmac: true,
        encrypted: false,
        readback: false,
    };
    pub const HMAC_ENCRYPTED: Self = Self {
        hmac: true,
        encrypted: true,
        readback: false,
    };
    pub const HMAC_READBACK: Self = Self {
        hmac: true,
        encrypted: false,
        readback: true,
    };
}

/// The 0x40-byte metadata block prepended to the data when computing the
/// filesystem HMAC.
///
/// Superblocks seed with their first cluster number; file clusters seed with
/// the owning FST record's identity and the cluster's position in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmacSeed([u8; HMAC_SEED_SIZE]);

impl HmacSeed {
    /// Seed for a superblock span starting at `cluster`.
    #[must_use]
    pub fn superblock(cluster: ClusterIndex) -> Self {
        let mut seed = [0_u8; HMAC_SEED_SIZE];
        seed[HMAC_SEED_CLUSTER_OFFSET..HMAC_SEED_CLUSTER_OFFSET + 2]
            .copy_from_slice(&cluster.0.to_be_bytes());
        Self(seed)
    }

    /// Seed for data cluster `chain_index` of the file described by `entry`
    /// at FST position `index`.
    #[must_use]
    pub fn file(entry: &FstEntry, index: FstIndex, chain_index: u32) -> Self {
        let mut seed = [0_u8; HMAC_SEED_SIZE];
        seed[0x00..0x02].copy_from_slice(&entry.x1.to_be_bytes());
        seed[0x02..0x04].copy_from_slice(&entry.uid.to_be_bytes());
        seed[0x04..0x10].copy_from_slice(&entry.name);
        seed[0x10..0x14].copy_from_slice(&chain_index.to_be_bytes());
        seed[0x14..0x18].copy_from_slice(&u32::from(index.0).to_be_bytes());
        seed[0x18..0x1C].copy_from_slice(&entry.x3.to_be_bytes());
        Self(seed)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HMAC_SEED_SIZE] {
        &self.0
    }
}

/// Outcome annotations of a successful cluster read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStatus {
    /// At least one page needed a single-bit repair.
    pub ecc_corrected: bool,
    /// Only one of the two spare HMAC copies matched the data.
    pub hmac_partial: bool,
}

/// Outcome annotations of a successful cluster write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStatus {
    /// The post-write readback needed a single-bit repair.
    pub ecc_corrected: bool,
}

/// One mountable ISFS volume bound to its backing device and keys.
pub struct Volume {
    id: VolumeId,
    device: VolumeDevice,
    aes: [u8; AES_KEY_LEN],
    hmac: [u8; HMAC_KEY_LEN],
}

impl Volume {
    /// Volume with no keys loaded yet.
    ///
    /// The superblock slot scan reads without keys; [`Volume::load_keys`]
    /// fills them in once the scan has decided the key-set version.
    #[must_use]
    pub fn new(id: VolumeId, device: VolumeDevice) -> Self {
        Self {
            id,
            device,
            aes: [0; AES_KEY_LEN],
            hmac: [0; HMAC_KEY_LEN],
        }
    }

    #[must_use]
    pub fn id(&self) -> VolumeId {
        self.id
    }

    /// Select the AES and HMAC keys matching a superblock key-set version.
    pub fn load_keys(&mut self, otp: &Otp, version: u8) {
        self.aes = otp.isfs_aes_key(version);
        self.hmac = otp.isfs_hmac_key(version);
    }

    /// Read whole clusters starting at `start` into `out`.
    ///
    /// The cluster count comes from the buffer length. When the HMAC flag is
    /// set, `seed` must be given and the digest over seed plus plaintext is
    /// checked against both spare copies: two matches is a clean read, one
    /// match is reported in the status, zero is an error. Hard page failures
    /// outrank uncorrectable ECC, which outranks an HMAC mismatch.
    pub fn read_volume(
        &self,
        start: ClusterIndex,
        flags: VolumeFlags,
        seed: Option<&HmacSeed>,
        out: &mut [u8],
    ) -> Result<ReadStatus> {
        check_span(start, out.len(), "read")?;
        match &self.device {
            VolumeDevice::Nand(nand) => self.read_nand(nand.as_ref(), start, flags, seed, out),
            VolumeDevice::Red(red) => self.read_red(red, start, flags, out),
        }
    }

    /// Write whole clusters starting at `start`.
    ///
    /// NAND erases in eight-cluster blocks, so every touched block is staged
    /// in full: requested clusters from `data`, the rest read back from
    /// flash, then erase and reprogram. The HMAC digest covers the whole
    /// request and lands in the spares of every written cluster. `data` is
    /// never modified; encryption happens in the staging buffers.
    pub fn write_volume(
        &self,
        start: ClusterIndex,
        flags: VolumeFlags,
        seed: Option<&HmacSeed>,
        data: &[u8],
    ) -> Result<WriteStatus> {
        let count = check_span(start, data.len(), "write")?;
        match &self.device {
            VolumeDevice::Nand(nand) => {
                self.write_nand(nand.as_ref(), start, count, flags, seed, data)
            }
            VolumeDevice::Red(red) => self.write_red(red, start, flags, data),
        }
    }

    fn read_nand(
        &self,
        nand: &dyn NandDevice,
        start: ClusterIndex,
        flags: VolumeFlags,
        seed: Option<&HmacSeed>,
        out: &mut [u8],
    ) -> Result<ReadStatus> {
        let mut saved = [[0_u8; HMAC_LEN]; 2];
        let mut cipher = AesCbc::new(self.aes);
        let mut ecc_corrected = false;
        let mut failed_page: Option<PageIndex> = None;
        let mut failed_cluster: Option<ClusterIndex> = None;

        for (i, chunk) in out.chunks_exact_mut(CLUSTER_SIZE).enumerate() {
            let cluster = ClusterIndex(start.0 + i as u16);
            let base = cluster.first_page();
            for p in 0..CLUSTER_PAGES {
                let page = PageIndex(base.0 + p);
                let data = &mut chunk[p as usize * PAGE_SIZE..(p as usize + 1) * PAGE_SIZE];
                let mut spare = [0_u8; PAGE_SPARE_SIZE];
                match nand.read_page(page, data, &mut spare) {
                    Ok(()) => {
                        if !nand.is_precorrected() {
                            match correct_page(data, &spare) {
                                EccStatus::Clean => {}
                                EccStatus::Corrected => ecc_corrected = true,
                                EccStatus::Uncorrectable => {
                                    if failed_cluster.is_none() {
                                        failed_cluster = Some(cluster);
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%page, %err, "page read failed");
                        if failed_page.is_none() {
                            failed_page = Some(page);
                        }
                    }
                }
                // The span HMAC sits in the spares of pages 6 and 7 of each
                // cluster; later clusters overwrite earlier copies.
                if p == 6 {
                    saved[0].copy_from_slice(&spare[1..1 + HMAC_LEN]);
                    saved[1][..12].copy_from_slice(&spare[1 + HMAC_LEN..1 + HMAC_LEN + 12]);
                } else if p == 7 {
                    saved[1][12..].copy_from_slice(&spare[1..9]);
                }
            }
            if flags.encrypted {
                cipher.decrypt(chunk, false)?;
            }
        }

        if let Some(page) = failed_page {
            return Err(MinuteError::Read { page });
        }
        if let Some(cluster) = failed_cluster {
            return Err(MinuteError::Ecc { cluster });
        }

        let mut hmac_partial = false;
        if flags.hmac {
            let seed = seed
                .ok_or_else(|| MinuteError::Format("HMAC-checked read needs a seed".to_string()))?;
            let mac = hmac_sha1(&self.hmac, &[seed.as_bytes(), out]);
            let matched = usize::from(saved[0] == mac) + usize::from(saved[1] == mac);
            match matched {
                2 => {}
                1 => {
                    warn!(cluster = %start, "only one spare HMAC copy matches");
                    hmac_partial = true;
                }
                _ => return Err(MinuteError::Hmac { cluster: start }),
            }
        }

        Ok(ReadStatus {
            ecc_corrected,
            hmac_partial,
        })
    }

    fn read_red(
        &self,
        red: &RedNand,
        start: ClusterIndex,
        flags: VolumeFlags,
        out: &mut [u8],
    ) -> Result<ReadStatus> {
        red.read_clusters(start, out)?;
        if flags.encrypted {
            let mut cipher = AesCbc::new(self.aes);
            for chunk in out.chunks_exact_mut(CLUSTER_SIZE) {
                cipher.decrypt(chunk, false)?;
            }
        }
        Ok(ReadStatus::default())
    }

    fn write_nand(
        &self,
        nand: &dyn NandDevice,
        start: ClusterIndex,
        count: u16,
        flags: VolumeFlags,
        seed: Option<&HmacSeed>,
        data: &[u8],
    ) -> Result<WriteStatus> {
        let mac = if flags.hmac {
            let seed = seed.ok_or_else(|| {
                MinuteError::Format("HMAC-covered write needs a seed".to_string())
            })?;
            Some(hmac_sha1(&self.hmac, &[seed.as_bytes(), data]))
        } else {
            None
        };

        let last = start.0 + count - 1;
        let first_block = start.0 / BLOCK_CLUSTERS;
        let last_block = last / BLOCK_CLUSTERS;

        let mut cipher = AesCbc::new(self.aes);
        let mut ecc_corrected = false;
        let mut block_data = vec![0_u8; BLOCK_PAGES as usize * PAGE_SIZE];
        let mut block_spares = vec![0_u8; BLOCK_PAGES as usize * PAGE_SPARE_SIZE];
        let mut rb_data = vec![0_u8; PAGE_SIZE];

        for block in first_block..=last_block {
            let block_first = PageIndex(u32::from(block) * BLOCK_PAGES);

            for c in 0..BLOCK_CLUSTERS {
                let cluster = ClusterIndex(block * BLOCK_CLUSTERS + c);
                let cdata = &mut block_data[usize::from(c) * CLUSTER_SIZE..][..CLUSTER_SIZE];
                let first_spare = usize::from(c) * CLUSTER_PAGES as usize * PAGE_SPARE_SIZE;
                let cspares =
                    &mut block_spares[first_spare..][..CLUSTER_PAGES as usize * PAGE_SPARE_SIZE];

                if cluster.0 >= start.0 && cluster.0 <= last {
                    let src = usize::from(cluster.0 - start.0) * CLUSTER_SIZE;
                    cdata.copy_from_slice(&data[src..src + CLUSTER_SIZE]);
                    if flags.encrypted {
                        cipher.encrypt(cdata, false)?;
                    }
                    for p in 0..CLUSTER_PAGES {
                        let spare = &mut cspares[p as usize * PAGE_SPARE_SIZE..][..PAGE_SPARE_SIZE];
                        spare.fill(0);
                        if let Some(mac) = &mac {
                            if p == 6 {
                                spare[1..1 + HMAC_LEN].copy_from_slice(mac);
                                spare[1 + HMAC_LEN..1 + HMAC_LEN + 12].copy_from_slice(&mac[..12]);
                            } else if p == 7 {
                                spare[1..9].copy_from_slice(&mac[12..]);
                            }
                        }
                    }
                } else {
                    // Preserved cluster. A page that no longer reads or
                    // corrects would be lost by the erase, so fail before
                    // touching the block.
                    let base = cluster.first_page();
                    for p in 0..CLUSTER_PAGES {
                        let page = PageIndex(base.0 + p);
                        let pdata = &mut cdata[p as usize * PAGE_SIZE..][..PAGE_SIZE];
                        let spare = &mut cspares[p as usize * PAGE_SPARE_SIZE..][..PAGE_SPARE_SIZE];
                        nand.read_page(page, pdata, spare)?;
                        if !nand.is_precorrected()
                            && correct_page(pdata, spare) == EccStatus::Uncorrectable
                        {
                            return Err(MinuteError::Read { page });
                        }
                    }
                }
            }

            nand.erase_block(block_first)?;

            // Program the whole block even past a failure so the rest of the
            // staged data lands; the first failure is what gets reported.
            let mut first_error: Option<MinuteError> = None;
            for p in 0..BLOCK_PAGES {
                let page = PageIndex(block_first.0 + p);
                let pdata = &block_data[p as usize * PAGE_SIZE..][..PAGE_SIZE];
                let spare = &block_spares[p as usize * PAGE_SPARE_SIZE..][..PAGE_SPARE_SIZE];
                if let Err(err) = program_page_ecc(nand, page, pdata, spare) {
                    warn!(%page, %err, "page program failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }

            if flags.readback {
                for p in 0..BLOCK_PAGES {
                    let page = PageIndex(block_first.0 + p);
                    let mut spare = [0_u8; PAGE_SPARE_SIZE];
                    nand.read_page(page, &mut rb_data, &mut spare)?;
                    if !nand.is_precorrected() {
                        match correct_page(&mut rb_data, &spare) {
                            EccStatus::Clean => {}
                            EccStatus::Corrected => ecc_corrected = true,
                            EccStatus::Uncorrectable => return Err(MinuteError::Read { page }),
                        }
                    }
                    let pdata = &block_data[p as usize * PAGE_SIZE..][..PAGE_SIZE];
                    let pspare = &block_spares[p as usize * PAGE_SPARE_SIZE..][..PAGE_SPARE_SIZE];
                    if rb_data.as_slice() != pdata || spare[1..0x21] != pspare[1..0x21] {
                        return Err(MinuteError::Readback { page });
                    }
                }
            }
        }

        Ok(WriteStatus { ecc_corrected })
    }

    fn write_red(
        &self,
        red: &RedNand,
        start: ClusterIndex,
        flags: VolumeFlags,
        data: &[u8],
    ) -> Result<WriteStatus> {
        // Encrypt a scratch copy; the caller keeps their plaintext.
        let mut staged = data.to_vec();
        if flags.encrypted {
            let mut cipher = AesCbc::new(self.aes);
            for chunk in staged.chunks_exact_mut(CLUSTER_SIZE) {
                cipher.encrypt(chunk, false)?;
            }
        }
        red.write_clusters(start, &staged)?;
        Ok(WriteStatus::default())
    }
}

/// Validate a cluster-span buffer and return its cluster count.
fn check_span(start: ClusterIndex, len: usize, what: &str) -> Result<u16> {
    if len == 0 || len % CLUSTER_SIZE != 0 {
        return Err(MinuteError::Format(format!(
            "{what} buffer is {len} bytes, need a whole number of {CLUSTER_SIZE}-byte clusters"
        )));
    }
    let count = len / CLUSTER_SIZE;
    if usize::from(start.0) + count > usize::from(CLUSTER_COUNT) {
        return Err(MinuteError::Format(format!(
            "cluster span {start}+{count} out of range"
        )));
    }
    Ok(count as u16)
}
