#![forbid(unsafe_code)]

pub mod e2e;
pub mod images;

use anyhow::{Context, Result, bail};
use mnt_ancast::ANCAST_PROBE_SIZE;
use mnt_ondisk::{AncastHeader, BootInfo, Mbr, SuperblockHeader};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A sparse byte image: mostly zero, with a handful of hex-encoded writes.
///
/// Fixtures under `conformance/fixtures/` use this form so the interesting
/// bytes of an on-media structure stay reviewable in a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;

    let mut bytes = vec![0_u8; fixture.size];
    for write in fixture.writes {
        let payload = hex::decode(write.hex)
            .with_context(|| format!("invalid hex at offset {}", write.offset))?;

        let end = write
            .offset
            .checked_add(payload.len())
            .context("fixture offset overflow")?;
        if end > bytes.len() {
            bail!(
                "fixture write out of bounds: offset={} payload={} size={}",
                write.offset,
                payload.len(),
                bytes.len()
            );
        }

        bytes[write.offset..end].copy_from_slice(&payload);
    }

    Ok(bytes)
}

/// Capture a byte range of a real image as a single-write fixture, rebased
/// to offset zero.
pub fn extract_region(data: &[u8], offset: usize, len: usize) -> Result<SparseFixture> {
    let end = offset.checked_add(len).context("region offset overflow")?;
    if end > data.len() {
        bail!(
            "region out of bounds: offset={offset} len={len} size={}",
            data.len()
        );
    }
    Ok(SparseFixture {
        size: len,
        writes: vec![FixtureWrite {
            offset: 0,
            hex: hex::encode(&data[offset..end]),
        }],
    })
}

/// Capture the loader probe window of a signed image, after proving the
/// header in it actually parses.
pub fn extract_ancast_probe(data: &[u8]) -> Result<SparseFixture> {
    AncastHeader::parse(data).context("image does not open with a signed-image header")?;
    extract_region(data, 0, ANCAST_PROBE_SIZE.min(data.len()))
}

pub fn validate_ancast_fixture(path: &Path) -> Result<AncastHeader> {
    let data = load_sparse_fixture(path)?;
    AncastHeader::parse(&data)
        .with_context(|| format!("failed ancast parse for fixture {}", path.display()))
}

pub fn validate_superblock_fixture(path: &Path) -> Result<SuperblockHeader> {
    let data = load_sparse_fixture(path)?;
    SuperblockHeader::parse(&data)
        .with_context(|| format!("failed superblock parse for fixture {}", path.display()))
}

pub fn validate_mbr_fixture(path: &Path) -> Result<Mbr> {
    let data = load_sparse_fixture(path)?;
    Mbr::parse(&data).with_context(|| format!("failed MBR parse for fixture {}", path.display()))
}

pub fn validate_boot_info_fixture(path: &Path) -> Result<BootInfo> {
    let data = load_sparse_fixture(path)?;
    BootInfo::parse(&data)
        .with_context(|| format!("failed boot_info parse for fixture {}", path.display()))
}
