//! ISFS superblock layout: 0xC header, `u16[0x8000]` FAT, 6143 FST records.
//!
//! A superblock occupies 16 clusters (0x40000 bytes). Candidate copies live
//! in the reserved tail of the cluster space, `super_count` slots of 16
//! clusters each. The header magic doubles as the key-set version selector:
//! `SFFS` is version 0 (Wii keys), `SFS!` is version 1 (Wii U keys).

use mnt_types::{
    ensure_slice, ensure_slice_mut, read_be_u16, read_be_u32, read_fixed, trim_nul_padded,
    write_be_u16, write_be_u32, ClusterIndex, FatEntry, FstIndex, Generation, ParseError,
    SuperSlot, CLUSTER_COUNT, FST_ENTRY_COUNT, FST_ENTRY_SIZE, ISFSHAX_INFO_OFFSET,
    SUPER_CLUSTERS, SUPER_FAT_OFFSET, SUPER_FST_OFFSET, SUPER_MAGIC_V0, SUPER_MAGIC_V1,
    SUPER_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::isfshax::IsfshaxInfo;

/// First cluster of a superblock slot within the reserved tail region.
///
/// Slot `super_count - 1` ends exactly at the last cluster of the bank.
#[must_use]
pub fn slot_cluster(super_count: u8, slot: SuperSlot) -> Option<ClusterIndex> {
    if slot.0 >= super_count {
        return None;
    }
    let back = u16::from(super_count - slot.0) * SUPER_CLUSTERS;
    Some(ClusterIndex(CLUSTER_COUNT - back))
}

// ── Header ──────────────────────────────────────────────────────────────────

/// The 0xC bytes in front of the FAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockHeader {
    /// Key-set version decoded from the magic (0 = Wii, 1 = Wii U).
    pub version: u8,
    pub generation: Generation,
    pub x1: u32,
}

impl SuperblockHeader {
    /// Parse from the first bytes of a superblock (a single leading cluster
    /// is enough, as used by the slot scan).
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<4>(data, 0)?;
        let version = if magic == SUPER_MAGIC_V0 {
            0
        } else if magic == SUPER_MAGIC_V1 {
            1
        } else {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_be_bytes(SUPER_MAGIC_V0)),
                actual: u64::from(u32::from_be_bytes(magic)),
            });
        };

        Ok(Self {
            version,
            generation: Generation(read_be_u32(data, 0x4)?),
            x1: read_be_u32(data, 0x8)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        let magic = match self.version {
            0 => SUPER_MAGIC_V0,
            1 => SUPER_MAGIC_V1,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "version",
                    reason: "unknown key-set version",
                });
            }
        };
        ensure_slice_mut(data, 0, 4)?.copy_from_slice(&magic);
        write_be_u32(data, 0x4, self.generation.0)?;
        write_be_u32(data, 0x8, self.x1)?;
        Ok(())
    }
}

// ── FST records ─────────────────────────────────────────────────────────────

/// Entry type from the low two bits of `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FstKind {
    Free,
    File,
    Directory,
    Unknown,
}

impl FstKind {
    #[must_use]
    pub fn from_mode(mode: u8) -> Self {
        match mode & 0b11 {
            0 => Self::Free,
            1 => Self::File,
            2 => Self::Directory,
            _ => Self::Unknown,
        }
    }
}

/// One 0x20-byte FST record.
///
/// For directories `sub` is the first child record and `sib` the next
/// sibling; for files `sub` is the first cluster of the data chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstEntry {
    pub name: [u8; 12],
    pub mode: u8,
    pub attr: u8,
    pub sub: u16,
    pub sib: u16,
    pub size: u32,
    pub x1: u16,
    pub uid: u16,
    pub gid: u16,
    pub x3: u32,
}

impl FstEntry {
    /// An all-zero record, i.e. a free FST slot.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            name: [0; 12],
            mode: 0,
            attr: 0,
            sub: 0,
            sib: 0,
            size: 0,
            x1: 0,
            uid: 0,
            gid: 0,
            x3: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            name: read_fixed::<12>(data, 0x00)?,
            mode: ensure_slice(data, 0x0C, 1)?[0],
            attr: ensure_slice(data, 0x0D, 1)?[0],
            sub: read_be_u16(data, 0x0E)?,
            sib: read_be_u16(data, 0x10)?,
            size: read_be_u32(data, 0x12)?,
            x1: read_be_u16(data, 0x16)?,
            uid: read_be_u16(data, 0x18)?,
            gid: read_be_u16(data, 0x1A)?,
            x3: read_be_u32(data, 0x1C)?,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice_mut(data, 0x00, 12)?.copy_from_slice(&self.name);
        ensure_slice_mut(data, 0x0C, 2)?.copy_from_slice(&[self.mode, self.attr]);
        write_be_u16(data, 0x0E, self.sub)?;
        write_be_u16(data, 0x10, self.sib)?;
        write_be_u32(data, 0x12, self.size)?;
        write_be_u16(data, 0x16, self.x1)?;
        write_be_u16(data, 0x18, self.uid)?;
        write_be_u16(data, 0x1A, self.gid)?;
        write_be_u32(data, 0x1C, self.x3)?;
        Ok(())
    }

    #[must_use]
    pub fn kind(&self) -> FstKind {
        FstKind::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind() == FstKind::File
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind() == FstKind::Directory
    }

    /// Decoded NUL-padded name.
    #[must_use]
    pub fn name(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// Byte-compare against a path component the way the firmware does,
    /// over the fixed field width.
    #[must_use]
    pub fn name_matches(&self, component: &str) -> bool {
        let bytes = component.as_bytes();
        if bytes.len() > self.name.len() {
            return false;
        }
        self.name[..bytes.len()] == *bytes
            && self.name.get(bytes.len()).map_or(true, |b| *b == 0)
    }

    /// First child record of a directory.
    #[must_use]
    pub fn first_child(&self) -> Option<FstIndex> {
        FstIndex::from_link(self.sub)
    }

    /// Next sibling record.
    #[must_use]
    pub fn next_sibling(&self) -> Option<FstIndex> {
        FstIndex::from_link(self.sib)
    }

    /// First data cluster of a file, `None` when out of range (empty files
    /// carry a FAT sentinel here).
    #[must_use]
    pub fn first_cluster(&self) -> Option<ClusterIndex> {
        (self.sub < CLUSTER_COUNT).then_some(ClusterIndex(self.sub))
    }
}

// ── Owned superblock ────────────────────────────────────────────────────────

/// An owned 0x40000-byte superblock image with typed accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    buf: Vec<u8>,
}

impl Superblock {
    /// Take ownership of a full 16-cluster superblock read.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, ParseError> {
        if buf.len() != SUPER_SIZE {
            return Err(ParseError::InvalidField {
                field: "superblock",
                reason: "not exactly 16 clusters",
            });
        }
        // Magic must already be coherent.
        SuperblockHeader::parse(&buf)?;
        Ok(Self { buf })
    }

    pub fn header(&self) -> Result<SuperblockHeader, ParseError> {
        SuperblockHeader::parse(&self.buf)
    }

    pub fn set_header(&mut self, header: &SuperblockHeader) -> Result<(), ParseError> {
        header.write_to(&mut self.buf)
    }

    pub fn generation(&self) -> Result<Generation, ParseError> {
        Ok(self.header()?.generation)
    }

    pub fn set_generation(&mut self, generation: Generation) -> Result<(), ParseError> {
        write_be_u32(&mut self.buf, 0x4, generation.0)
    }

    pub fn version(&self) -> Result<u8, ParseError> {
        Ok(self.header()?.version)
    }

    fn fat_offset(cluster: ClusterIndex) -> Result<usize, ParseError> {
        if cluster.0 >= CLUSTER_COUNT {
            return Err(ParseError::InvalidField {
                field: "cluster",
                reason: "beyond bank",
            });
        }
        Ok(SUPER_FAT_OFFSET + 2 * usize::from(cluster.0))
    }

    pub fn fat(&self, cluster: ClusterIndex) -> Result<FatEntry, ParseError> {
        let raw = read_be_u16(&self.buf, Self::fat_offset(cluster)?)?;
        Ok(FatEntry::from_raw(raw))
    }

    pub fn set_fat(&mut self, cluster: ClusterIndex, entry: FatEntry) -> Result<(), ParseError> {
        write_be_u16(&mut self.buf, Self::fat_offset(cluster)?, entry.to_raw())
    }

    fn fst_offset(index: FstIndex) -> Result<usize, ParseError> {
        if usize::from(index.0) >= FST_ENTRY_COUNT {
            return Err(ParseError::InvalidField {
                field: "fst_index",
                reason: "beyond record array",
            });
        }
        Ok(SUPER_FST_OFFSET + FST_ENTRY_SIZE * usize::from(index.0))
    }

    pub fn fst(&self, index: FstIndex) -> Result<FstEntry, ParseError> {
        let off = Self::fst_offset(index)?;
        FstEntry::parse(&self.buf[off..off + FST_ENTRY_SIZE])
    }

    pub fn set_fst(&mut self, index: FstIndex, entry: &FstEntry) -> Result<(), ParseError> {
        let off = Self::fst_offset(index)?;
        entry.write_to(&mut self.buf[off..off + FST_ENTRY_SIZE])
    }

    /// Root directory record.
    pub fn fst_root(&self) -> Result<FstEntry, ParseError> {
        self.fst(FstIndex(0))
    }

    /// Embedded redundancy info, if this generation carries one.
    #[must_use]
    pub fn isfshax_info(&self) -> Option<IsfshaxInfo> {
        IsfshaxInfo::parse(&self.buf[ISFSHAX_INFO_OFFSET..]).ok()
    }

    pub fn set_isfshax_info(&mut self, info: &IsfshaxInfo) -> Result<(), ParseError> {
        info.write_to(&mut self.buf[ISFSHAX_INFO_OFFSET..])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnt_types::{ISFSHAX_GENERATION_FIRST, ISFSHAX_MAGIC, ISFSHAX_REDUNDANCY};

    fn blank_super(version: u8, generation: u32) -> Superblock {
        let mut buf = vec![0_u8; SUPER_SIZE];
        let header = SuperblockHeader {
            version,
            generation: Generation(generation),
            x1: 0,
        };
        header.write_to(&mut buf).expect("write header");
        Superblock::from_bytes(buf).expect("owned superblock")
    }

    #[test]
    fn header_parses_both_magics() {
        let mut data = [0_u8; 0xC];
        data[..4].copy_from_slice(b"SFFS");
        data[4..8].copy_from_slice(&7_u32.to_be_bytes());
        let header = SuperblockHeader::parse(&data).expect("v0 header");
        assert_eq!(header.version, 0);
        assert_eq!(header.generation, Generation(7));

        data[..4].copy_from_slice(b"SFS!");
        assert_eq!(SuperblockHeader::parse(&data).expect("v1 header").version, 1);

        data[..4].copy_from_slice(b"SFSX");
        assert!(matches!(
            SuperblockHeader::parse(&data),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn slot_cluster_mapping() {
        // 64-slot bank: slots cover the last 0x400 clusters.
        assert_eq!(slot_cluster(64, SuperSlot(0)), Some(ClusterIndex(0x7C00)));
        assert_eq!(slot_cluster(64, SuperSlot(63)), Some(ClusterIndex(0x7FF0)));
        // 16-slot bank (vWii compat).
        assert_eq!(slot_cluster(16, SuperSlot(0)), Some(ClusterIndex(0x7F00)));
        assert_eq!(slot_cluster(16, SuperSlot(15)), Some(ClusterIndex(0x7FF0)));
        assert_eq!(slot_cluster(16, SuperSlot(16)), None);
    }

    #[test]
    fn fat_cells_round_trip() {
        let mut sb = blank_super(1, 1);
        sb.set_fat(ClusterIndex(4), FatEntry::Chain(ClusterIndex(5)))
            .expect("set chain");
        sb.set_fat(ClusterIndex(5), FatEntry::Last).expect("set last");

        assert_eq!(
            sb.fat(ClusterIndex(4)).expect("chain"),
            FatEntry::Chain(ClusterIndex(5))
        );
        assert_eq!(sb.fat(ClusterIndex(5)).expect("last"), FatEntry::Last);
        assert_eq!(sb.fat(ClusterIndex(6)).expect("untouched"), FatEntry::Chain(ClusterIndex(0)));

        assert!(sb.fat(ClusterIndex(0x8000)).is_err());
    }

    #[test]
    fn fst_records_round_trip() {
        let mut sb = blank_super(1, 1);
        let mut entry = FstEntry {
            name: [0; 12],
            mode: 1,
            attr: 0,
            sub: 0x123,
            sib: 0xFFFF,
            size: 0x4000,
            x1: 0,
            uid: 0x1001,
            gid: 0x0203,
            x3: 0,
        };
        entry.name[..8].copy_from_slice(b"test.bin");

        sb.set_fst(FstIndex(2), &entry).expect("set fst");
        let read_back = sb.fst(FstIndex(2)).expect("get fst");
        assert_eq!(read_back, entry);
        assert_eq!(read_back.name(), "test.bin");
        assert!(read_back.is_file());
        assert_eq!(read_back.first_cluster(), Some(ClusterIndex(0x123)));
        assert_eq!(read_back.next_sibling(), None);

        assert!(sb.fst(FstIndex(6143)).is_err());
    }

    #[test]
    fn fst_name_matching_uses_field_width() {
        let mut entry = FstEntry {
            name: [0; 12],
            mode: 2,
            attr: 0,
            sub: 0xFFFF,
            sib: 0xFFFF,
            size: 0,
            x1: 0,
            uid: 0,
            gid: 0,
            x3: 0,
        };
        entry.name[..5].copy_from_slice(b"title");
        assert!(entry.name_matches("title"));
        assert!(!entry.name_matches("titles"));
        assert!(!entry.name_matches("titl"));

        // Exactly 12 bytes, no terminator on flash.
        entry.name.copy_from_slice(b"abcdefghijkl");
        assert!(entry.name_matches("abcdefghijkl"));
        assert!(!entry.name_matches("abcdefghijklm"));
    }

    #[test]
    fn fst_kind_mapping() {
        assert_eq!(FstKind::from_mode(0), FstKind::Free);
        assert_eq!(FstKind::from_mode(1), FstKind::File);
        assert_eq!(FstKind::from_mode(2), FstKind::Directory);
        assert_eq!(FstKind::from_mode(3), FstKind::Unknown);
        // Upper bits do not matter.
        assert_eq!(FstKind::from_mode(0xF1), FstKind::File);
    }

    #[test]
    fn isfshax_info_absent_on_plain_superblock() {
        let sb = blank_super(1, 1);
        assert!(sb.isfshax_info().is_none());
    }

    #[test]
    fn isfshax_info_round_trips_through_superblock() {
        use crate::isfshax::IsfshaxSlot;

        let mut sb = blank_super(1, ISFSHAX_GENERATION_FIRST);
        let info = IsfshaxInfo {
            slots: [
                IsfshaxSlot { bad: false, ecc_correctable: false, slot: 60 },
                IsfshaxSlot { bad: false, ecc_correctable: true, slot: 61 },
                IsfshaxSlot { bad: true, ecc_correctable: false, slot: 62 },
                IsfshaxSlot { bad: false, ecc_correctable: false, slot: 63 },
            ],
            generation: Generation(ISFSHAX_GENERATION_FIRST),
            generation_base: Generation(ISFSHAX_GENERATION_FIRST),
            index: 0,
        };
        sb.set_isfshax_info(&info).expect("embed info");

        let read_back = sb.isfshax_info().expect("info present");
        assert_eq!(read_back, info);
        assert_eq!(read_back.slots.len(), ISFSHAX_REDUNDANCY);

        // The magic really is at the packed tail offset.
        let tail = &sb.as_bytes()[ISFSHAX_INFO_OFFSET..ISFSHAX_INFO_OFFSET + 4];
        assert_eq!(tail, ISFSHAX_MAGIC.to_be_bytes());
    }

    #[test]
    fn wrong_length_buffer_rejected() {
        assert!(Superblock::from_bytes(vec![0; SUPER_SIZE - 1]).is_err());
        assert!(Superblock::from_bytes(vec![0; SUPER_SIZE + 1]).is_err());
    }
}
