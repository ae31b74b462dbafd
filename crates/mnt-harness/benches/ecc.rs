#![forbid(unsafe_code)]

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use mnt_nand::{blank_spare, calc_subblock_ecc, correct_page, EccStatus};
use mnt_types::{ECC_SUBBLOCK_SIZE, PAGE_SIZE};

fn patterned_page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn bench_subblock_code(c: &mut Criterion) {
    let page = patterned_page(0x21);

    c.bench_function("ecc_subblock_code", |b| {
        b.iter(|| calc_subblock_ecc(black_box(&page[..ECC_SUBBLOCK_SIZE])));
    });
}

fn bench_blank_spare(c: &mut Criterion) {
    let page = patterned_page(0x21);

    c.bench_function("ecc_blank_spare", |b| {
        b.iter(|| blank_spare(black_box(&page)));
    });
}

fn bench_correct_clean(c: &mut Criterion) {
    let mut page = patterned_page(0x42);
    let spare = blank_spare(&page);

    // A clean page is never modified, so the buffer can be reused.
    c.bench_function("ecc_correct_clean", |b| {
        b.iter(|| {
            let status = correct_page(black_box(&mut page), black_box(&spare));
            assert_eq!(status, EccStatus::Clean);
        });
    });
}

fn bench_correct_single_flip(c: &mut Criterion) {
    let page = patterned_page(0x42);
    let spare = blank_spare(&page);
    let mut flipped = page;
    flipped[517] ^= 0x08;

    // The repair mutates in place, so each iteration gets a fresh copy.
    c.bench_function("ecc_correct_single_flip", |b| {
        b.iter_batched(
            || flipped.clone(),
            |mut data| {
                let status = correct_page(black_box(&mut data), black_box(&spare));
                assert_eq!(status, EccStatus::Corrected);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    ecc,
    bench_subblock_code,
    bench_blank_spare,
    bench_correct_clean,
    bench_correct_single_flip,
);
criterion_main!(ecc);
