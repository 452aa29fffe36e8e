//! Filterbank benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array3;
use rf_filterbank::{Complex32, FRAME_SIZE, Filterbank, FrameAdapter, NUM_BANDS, TIME_SLOTS};

fn bench_forward_inverse_16ch(c: &mut Criterion) {
    let channels = 16;
    let mut fb = Filterbank::new(channels, channels);
    let mut spectra = Array3::<Complex32>::zeros((NUM_BANDS, channels, TIME_SLOTS));
    let input: Vec<Vec<f32>> = (0..channels)
        .map(|ch| (0..FRAME_SIZE).map(|i| ((i + ch) as f32 * 0.01).sin()).collect())
        .collect();
    let mut output = vec![vec![0.0f32; FRAME_SIZE]; channels];

    c.bench_function("filterbank_16ch_frame", |b| {
        b.iter(|| {
            fb.forward(black_box(&input), spectra.view_mut());
            fb.inverse(spectra.view(), &mut output);
        })
    });
}

fn bench_adapter_512(c: &mut Criterion) {
    let mut adapter = FrameAdapter::new(16, 16);
    let input = vec![vec![0.1f32; 512]; 16];
    let mut output = vec![vec![0.0f32; 512]; 16];

    c.bench_function("frame_adapter_16ch_512", |b| {
        b.iter(|| {
            adapter.process_block(black_box(&input), &mut output, 512, |inp, out| {
                for (o, i) in out.iter_mut().zip(inp) {
                    o.copy_from_slice(i);
                }
                true
            });
        })
    });
}

criterion_group!(benches, bench_forward_inverse_16ch, bench_adapter_512);
criterion_main!(benches);
