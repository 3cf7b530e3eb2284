// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Performance benchmarks for segment encoding and CHK block encoding

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use splitfile_insert::{CHK_BLOCK_SIZE, ChkBlock, FecCodec, SplitfileAlgorithm};

fn bench_segment_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_encode");
    group.sample_size(10);

    for data_blocks in [8usize, 32, 128] {
        let codec =
            FecCodec::for_segment(SplitfileAlgorithm::OnionStandard, data_blocks, 128, 128)
                .unwrap();
        let data: Vec<Vec<u8>> = (0..data_blocks)
            .map(|i| vec![i as u8; CHK_BLOCK_SIZE])
            .collect();

        group.throughput(Throughput::Bytes((data_blocks * CHK_BLOCK_SIZE) as u64));
        group.bench_with_input(
            BenchmarkId::new("onion_standard", format!("{}blocks", data_blocks)),
            &data,
            |b, data| {
                b.iter(|| codec.encode(black_box(data)).unwrap());
            },
        );
    }

    group.finish();
}

fn bench_chk_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chk_encode");

    for size in [1024usize, CHK_BLOCK_SIZE] {
        let block: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("chk", size), &block, |b, block| {
            b.iter(|| ChkBlock::encode(black_box(block)).unwrap());
        });
    }

    group.finish();
}

fn bench_chk_decode(c: &mut Criterion) {
    let block = ChkBlock::encode(&vec![0xA5u8; CHK_BLOCK_SIZE]).unwrap();

    c.bench_function("chk_decode", |b| {
        b.iter(|| black_box(&block).decode().unwrap());
    });
}

criterion_group!(benches, bench_segment_encode, bench_chk_encode, bench_chk_decode);
criterion_main!(benches);
