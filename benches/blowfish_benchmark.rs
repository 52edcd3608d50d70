// SPDX-License-Identifier: MIT OR Apache-2.0

use criterion::{Criterion, criterion_group, criterion_main};
use pk2::blowfish::Blowfish;

fn bench_key_schedule() {
    Blowfish::new(b"169841").unwrap();
}

fn bench_encode_block(bf: &Blowfish) {
    let mut dst = [0u8; 2560];
    let src = [0u8; 2560];
    bf.encode(&src, &mut dst).unwrap();
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("blowfish key schedule", |b| b.iter(bench_key_schedule));

    let bf = Blowfish::new(b"169841").unwrap();
    c.bench_function("blowfish encode one entry block", |b| {
        b.iter(|| bench_encode_block(&bf))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
