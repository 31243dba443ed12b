use criterion::{black_box, criterion_group, criterion_main, Criterion};

use trellis::buffer::Buffer;

fn bench_buffer_cycle(c: &mut Criterion) {
    let chunk = vec![0xabu8; 4096];

    c.bench_function("buffer_append_consume_4k", |b| {
        let mut buffer = Buffer::with_capacity(64 * 1024);
        b.iter(|| {
            buffer.append(black_box(&chunk));
            buffer.consume(chunk.len());
        });
    });
}

fn bench_buffer_scan(c: &mut Criterion) {
    let mut buffer = Buffer::with_capacity(64 * 1024);
    for _ in 0..8 {
        buffer.append(&[0x55u8; 4096]);
    }

    c.bench_function("buffer_scan_32k", |b| {
        b.iter(|| {
            let slice = black_box(buffer.as_slice());
            slice.iter().map(|byte| *byte as u64).sum::<u64>()
        });
    });
}

criterion_group!(benches, bench_buffer_cycle, bench_buffer_scan);
criterion_main!(benches);
