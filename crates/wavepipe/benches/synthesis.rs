use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wavepipe::bench_reexport::kernel;
use wavepipe::BLOCK_WIDTH;

fn synthesis_benchmark(c: &mut Criterion) {
    let kern = kernel();

    c.bench_function("accumulate_one_channel", |b| {
        let mut out = [0.0f32; BLOCK_WIDTH];
        b.iter(|| {
            kern.accumulate(
                black_box(&mut out),
                black_box(123_456_789),
                black_box(987_654_321),
                black_box(12_345.0),
                black_box(0.5),
            );
        })
    });

    c.bench_function("accumulate_32_channels", |b| {
        let mut out = [0.0f32; BLOCK_WIDTH];
        b.iter(|| {
            for chn in 0..32u64 {
                kern.accumulate(
                    black_box(&mut out),
                    black_box(chn as i64 * 77_777_777),
                    black_box(31_250_000 + chn * 999_983),
                    black_box(1024.0),
                    black_box(0.0),
                );
            }
        })
    });
}

criterion_group!(benches, synthesis_benchmark);
criterion_main!(benches);
