//! Pipelined sector copies between two controllers.
//!
//! Large images move between independent controllers (a NAND-backed source
//! and an SD destination, or two cards), so the copy keeps one chunk in
//! flight on each side: while chunk n drains to the destination, chunk n+1
//! is already being read. Each side retries independently up to
//! [`COPY_RETRY_LIMIT`] attempts before the copy gives up with that side's
//! error.

use mnt_error::{MinuteError, Result};
use mnt_types::{SectorIndex, SECTOR_SIZE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::SectorDevice;

/// Sectors per in-flight chunk (256 KiB), the largest single transfer the
/// SD host issues.
pub const COPY_CHUNK_SECTORS: u32 = 512;

/// Attempts per chunk transfer before the copy is abandoned.
pub const COPY_RETRY_LIMIT: u32 = 8;

/// Outcome counters for one copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStats {
    pub sectors_copied: u32,
    pub chunks: u32,
    pub read_retries: u32,
    pub write_retries: u32,
}

fn offset(base: SectorIndex, sectors: u32) -> Result<SectorIndex> {
    base.checked_add(sectors)
        .ok_or_else(|| MinuteError::Format("sector offset overflows the device range".to_owned()))
}

fn check_span(dev: &dyn SectorDevice, base: SectorIndex, total: u32, side: &str) -> Result<()> {
    let end = offset(base, total)?;
    if end.0 > dev.sector_count() {
        return Err(MinuteError::Format(format!(
            "{side} span {base}+{total} exceeds the device ({} sectors)",
            dev.sector_count()
        )));
    }
    Ok(())
}

/// Run one transfer with bounded retries, returning the retry count.
fn transfer_retrying<F>(mut op: F, what: &str, first: SectorIndex) -> Result<u32>
where
    F: FnMut() -> Result<()>,
{
    let mut retries = 0;
    loop {
        match op() {
            Ok(()) => return Ok(retries),
            Err(err) => {
                retries += 1;
                if retries >= COPY_RETRY_LIMIT {
                    return Err(err);
                }
                debug!(%first, attempt = retries, error = %err, "{} failed, retrying", what);
            }
        }
    }
}

/// Copy `total_sectors` from `src` to `dst` with one chunk in flight on
/// each side.
///
/// Whole chunks run pipelined; the remainder (and the last buffered chunk)
/// drain sequentially at the end.
pub fn pipelined_copy(
    src: &dyn SectorDevice,
    src_base: SectorIndex,
    dst: &dyn SectorDevice,
    dst_base: SectorIndex,
    total_sectors: u32,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    if total_sectors == 0 {
        return Ok(stats);
    }
    check_span(src, src_base, total_sectors, "source")?;
    check_span(dst, dst_base, total_sectors, "destination")?;

    let chunk_bytes = COPY_CHUNK_SECTORS as usize * SECTOR_SIZE;
    let full_chunks = total_sectors / COPY_CHUNK_SECTORS;

    if full_chunks > 0 {
        let mut front = vec![0_u8; chunk_bytes];
        let mut back = vec![0_u8; chunk_bytes];

        // Prime the pipeline with the first chunk.
        stats.read_retries +=
            transfer_retrying(|| src.read_sectors(src_base, &mut front), "read", src_base)?;

        for i in 1..full_chunks {
            let read_at = offset(src_base, i * COPY_CHUNK_SECTORS)?;
            let write_at = offset(dst_base, (i - 1) * COPY_CHUNK_SECTORS)?;

            let read_buf = &mut back;
            let write_buf = &front;
            let (read_join, write_join) = std::thread::scope(|scope| {
                let reader = scope.spawn(move || {
                    transfer_retrying(|| src.read_sectors(read_at, read_buf), "read", read_at)
                });
                let writer = scope.spawn(move || {
                    transfer_retrying(|| dst.write_sectors(write_at, write_buf), "write", write_at)
                });
                (reader.join(), writer.join())
            });
            stats.read_retries += match read_join {
                Ok(res) => res?,
                Err(_) => {
                    return Err(MinuteError::Format("copy reader panicked".to_owned()));
                }
            };
            stats.write_retries += match write_join {
                Ok(res) => res?,
                Err(_) => {
                    return Err(MinuteError::Format("copy writer panicked".to_owned()));
                }
            };

            std::mem::swap(&mut front, &mut back);
            stats.chunks += 1;
            if (i * COPY_CHUNK_SECTORS) % 0x10000 == 0 {
                debug!(
                    sector = i * COPY_CHUNK_SECTORS,
                    total = total_sectors,
                    "copy progress"
                );
            }
        }

        // Drain the last buffered chunk.
        let write_at = offset(dst_base, (full_chunks - 1) * COPY_CHUNK_SECTORS)?;
        stats.write_retries +=
            transfer_retrying(|| dst.write_sectors(write_at, &front), "write", write_at)?;
        stats.chunks += 1;
    }

    let tail = total_sectors % COPY_CHUNK_SECTORS;
    if tail > 0 {
        let skip = total_sectors - tail;
        let read_at = offset(src_base, skip)?;
        let write_at = offset(dst_base, skip)?;
        let mut buf = vec![0_u8; tail as usize * SECTOR_SIZE];
        stats.read_retries +=
            transfer_retrying(|| src.read_sectors(read_at, &mut buf), "read", read_at)?;
        stats.write_retries +=
            transfer_retrying(|| dst.write_sectors(write_at, &buf), "write", write_at)?;
        stats.chunks += 1;
    }

    stats.sectors_copied = total_sectors;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSectorDevice;

    fn fill_patterned(dev: &MemSectorDevice, base: SectorIndex, sectors: u32) {
        let mut buf = vec![0_u8; SECTOR_SIZE];
        for s in 0..sectors {
            for (j, b) in buf.iter_mut().enumerate() {
                *b = (s as u8).wrapping_mul(7) ^ (j as u8);
            }
            dev.write_sectors(SectorIndex(base.0 + s), &buf).expect("fill");
        }
    }

    fn read_all(dev: &MemSectorDevice, base: SectorIndex, sectors: u32) -> Vec<u8> {
        let mut buf = vec![0_u8; sectors as usize * SECTOR_SIZE];
        dev.read_sectors(base, &mut buf).expect("read");
        buf
    }

    #[test]
    fn copy_matches_the_source_across_chunk_boundaries() {
        // Two full chunks plus an unaligned tail, at unaligned bases.
        let total = 2 * COPY_CHUNK_SECTORS + 77;
        let src = MemSectorDevice::new(total + 5);
        let dst = MemSectorDevice::new(total + 9);
        fill_patterned(&src, SectorIndex(5), total);

        let stats =
            pipelined_copy(&src, SectorIndex(5), &dst, SectorIndex(9), total).expect("copy");
        assert_eq!(stats.sectors_copied, total);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.read_retries, 0);
        assert_eq!(stats.write_retries, 0);

        assert_eq!(
            read_all(&src, SectorIndex(5), total),
            read_all(&dst, SectorIndex(9), total)
        );
    }

    #[test]
    fn short_copies_skip_the_pipeline() {
        let src = MemSectorDevice::new(64);
        let dst = MemSectorDevice::new(64);
        fill_patterned(&src, SectorIndex(0), 33);

        let stats =
            pipelined_copy(&src, SectorIndex(0), &dst, SectorIndex(0), 33).expect("copy");
        assert_eq!(stats.chunks, 1);
        assert_eq!(
            read_all(&src, SectorIndex(0), 33),
            read_all(&dst, SectorIndex(0), 33)
        );
    }

    #[test]
    fn transient_faults_are_retried_and_counted() {
        let total = 2 * COPY_CHUNK_SECTORS;
        let src = MemSectorDevice::new(total);
        let dst = MemSectorDevice::new(total);
        fill_patterned(&src, SectorIndex(0), total);

        // Second chunk read fails twice, first chunk write fails once.
        src.fail_reads(SectorIndex(COPY_CHUNK_SECTORS), 2);
        dst.fail_writes(SectorIndex(0), 1);

        let stats =
            pipelined_copy(&src, SectorIndex(0), &dst, SectorIndex(0), total).expect("copy");
        assert_eq!(stats.read_retries, 2);
        assert_eq!(stats.write_retries, 1);
        assert_eq!(
            read_all(&src, SectorIndex(0), total),
            read_all(&dst, SectorIndex(0), total)
        );
    }

    #[test]
    fn persistent_faults_abort_with_the_device_error() {
        let total = COPY_CHUNK_SECTORS;
        let src = MemSectorDevice::new(total);
        let dst = MemSectorDevice::new(total);
        src.fail_reads(SectorIndex(0), u32::MAX);

        let err = pipelined_copy(&src, SectorIndex(0), &dst, SectorIndex(0), total)
            .expect_err("must abort");
        assert!(err.is_media());
    }

    #[test]
    fn out_of_range_requests_are_rejected_up_front() {
        let src = MemSectorDevice::new(10);
        let dst = MemSectorDevice::new(10);
        assert!(matches!(
            pipelined_copy(&src, SectorIndex(0), &dst, SectorIndex(5), 6),
            Err(MinuteError::Format(_))
        ));
    }

    #[test]
    fn zero_length_copy_is_a_no_op() {
        let src = MemSectorDevice::new(4);
        let dst = MemSectorDevice::new(4);
        let stats =
            pipelined_copy(&src, SectorIndex(0), &dst, SectorIndex(0), 0).expect("copy");
        assert_eq!(stats, CopyStats::default());
    }
}
