use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framing::{encode, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};

fn decode_small_frame(c: &mut Criterion) {
    let wire = encode(&[0u8; 64]);

    c.bench_function("decode 64B frame", |b| {
        b.iter(|| {
            let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
            dec.feed(black_box(&wire), |frame| {
                black_box(frame);
            });
        })
    });
}

fn decode_many_small_frames(c: &mut Criterion) {
    let mut wire = Vec::new();
    for _ in 0..256 {
        let mut framed = encode(&[0u8; 32]);
        wire.append(&mut framed);
    }

    c.bench_function("decode 256x32B frames in one buffer", |b| {
        b.iter(|| {
            let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
            let mut count = 0usize;
            dec.feed(black_box(&wire), |_| count += 1);
            black_box(count);
        })
    });
}

criterion_group!(benches, decode_small_frame, decode_many_small_frames);
criterion_main!(benches);
