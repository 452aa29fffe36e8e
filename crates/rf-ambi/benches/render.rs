//! Render Path Benchmarks
//!
//! Per-block cost of the engine for loudspeaker and binaural output, and of
//! the control-path decoder rebuild.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rf_ambi::hoa::sh_count;
use rf_ambi::{AmbiEngine, LoudspeakerPreset, OutputLayout};

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_SIZE: usize = 512;
const ORDERS: &[usize] = &[1, 3, 5, 7];

fn generate_input(channels: usize, samples: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|c| {
            (0..samples)
                .map(|i| ((i * 7 + c * 13) % 101) as f32 / 50.0 - 1.0)
                .collect()
        })
        .collect()
}

fn ready_engine(order: usize, layout: OutputLayout) -> AmbiEngine {
    let engine = AmbiEngine::new();
    engine.init(SAMPLE_RATE);
    engine.set_order(order);
    engine.set_output_layout(layout);
    engine.init_codec();
    engine
}

fn bench_loudspeaker_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_7_0_4");
    group.throughput(Throughput::Elements(BLOCK_SIZE as u64));

    for &order in ORDERS {
        let engine = ready_engine(order, OutputLayout::Preset(LoudspeakerPreset::Atmos7_0_4));
        let input = generate_input(sh_count(order), BLOCK_SIZE);
        let mut output = vec![vec![0.0f32; BLOCK_SIZE]; engine.num_outputs()];
        let num_outputs = output.len();

        group.bench_with_input(BenchmarkId::from_parameter(order), &order, |b, _| {
            b.iter(|| {
                engine.process(black_box(&input), &mut output, input.len(), num_outputs, BLOCK_SIZE);
                black_box(&output);
            })
        });
    }

    group.finish();
}

fn bench_rotated_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_rotating");
    group.throughput(Throughput::Elements(BLOCK_SIZE as u64));

    for &order in ORDERS {
        let engine = ready_engine(order, OutputLayout::Preset(LoudspeakerPreset::Atmos7_0_4));
        let input = generate_input(sh_count(order), BLOCK_SIZE);
        let mut output = vec![vec![0.0f32; BLOCK_SIZE]; engine.num_outputs()];
        let num_outputs = output.len();
        let mut yaw = 0.0f32;

        group.bench_with_input(BenchmarkId::from_parameter(order), &order, |b, _| {
            b.iter(|| {
                yaw = (yaw + 1.0) % 360.0;
                engine.set_rotation(yaw, 10.0, 0.0);
                engine.process(black_box(&input), &mut output, input.len(), num_outputs, BLOCK_SIZE);
                black_box(&output);
            })
        });
    }

    group.finish();
}

fn bench_binaural_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_binaural");
    group.throughput(Throughput::Elements(BLOCK_SIZE as u64));

    for &order in ORDERS {
        let engine = ready_engine(order, OutputLayout::Binaural);
        let input = generate_input(sh_count(order), BLOCK_SIZE);
        let mut output = vec![vec![0.0f32; BLOCK_SIZE]; 2];

        group.bench_with_input(BenchmarkId::from_parameter(order), &order, |b, _| {
            b.iter(|| {
                engine.process(black_box(&input), &mut output, input.len(), 2, BLOCK_SIZE);
                black_box(&output);
            })
        });
    }

    group.finish();
}

fn bench_codec_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_rebuild");
    group.sample_size(10);

    for &order in &[1usize, 3, 7] {
        let engine = AmbiEngine::new();
        engine.init(SAMPLE_RATE);
        engine.set_output_layout(OutputLayout::Preset(LoudspeakerPreset::Atmos9_0_6));

        group.bench_with_input(BenchmarkId::from_parameter(order), &order, |b, &order| {
            b.iter(|| {
                // Toggle so every iteration is a real rebuild
                engine.set_order(if engine.order() == order { order % 7 + 1 } else { order });
                black_box(engine.init_codec())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_loudspeaker_render,
    bench_rotated_render,
    bench_binaural_render,
    bench_codec_rebuild,
);
criterion_main!(benches);
