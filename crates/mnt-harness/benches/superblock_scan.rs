#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mnt_harness::{images, load_sparse_fixture};
use mnt_isfs::{find_super, read_super, write_super};
use mnt_ondisk::SuperblockHeader;
use mnt_types::{Generation, SuperSlot};
use std::path::Path;

fn fixture_path(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .expect("workspace root")
        .join("conformance/fixtures")
        .join(name)
}

fn bench_header_parse(c: &mut Criterion) {
    let data = load_sparse_fixture(&fixture_path("superblock_header_sparse.json"))
        .expect("load superblock fixture");

    c.bench_function("superblock_header_parse", |b| {
        b.iter(|| SuperblockHeader::parse(black_box(&data)).expect("header parse"));
    });
}

fn bench_slot_scan(c: &mut Criterion) {
    let otp = images::test_otp().expect("otp");
    let (_nand, volume) = images::keyed_slc(&otp);
    for (slot, generation) in [(0, 40), (1, 46), (2, 45), (3, 41), (4, 44), (5, 39)] {
        let superblock =
            images::formatted_superblock(1, images::SLC_SUPER_COUNT, Generation(generation))
                .expect("superblock");
        write_super(&volume, SuperSlot(slot), &superblock).expect("seed slot");
    }

    // One raw cluster read per slot across the whole 64-slot ring.
    c.bench_function("superblock_slot_scan", |b| {
        b.iter(|| {
            let found = find_super(
                black_box(&volume),
                Generation(0),
                Generation(u32::MAX),
            )
            .expect("scan hit");
            black_box(found);
        });
    });
}

fn bench_verified_read(c: &mut Criterion) {
    let otp = images::test_otp().expect("otp");
    let (_nand, volume) = images::keyed_slc(&otp);
    let superblock = images::formatted_superblock(1, images::SLC_SUPER_COUNT, Generation(52))
        .expect("superblock");
    write_super(&volume, SuperSlot(3), &superblock).expect("seed slot");

    // Full 256 KiB superblock through ECC and the HMAC check.
    c.bench_function("superblock_verified_read", |b| {
        b.iter(|| {
            let (superblock, status) =
                read_super(black_box(&volume), SuperSlot(3)).expect("verified read");
            black_box((superblock, status));
        });
    });
}

criterion_group!(
    superblock_scan,
    bench_header_parse,
    bench_slot_scan,
    bench_verified_read,
);
criterion_main!(superblock_scan);
