//! GRU forward benchmarks: criterion over hidden sizes, precisions and ISAs.
//!
//! Throughput is reported in timesteps per second.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use grurt::{Direction, ElemType, ExecContext, Gru, GruConfig, GruWeights, RuntimeConfig, Tensor};

const STEPS: usize = 64;

fn gen_sequence(steps: usize, i: usize) -> Vec<f32> {
    (0..steps * i).map(|k| ((k as f32) * 0.173).sin()).collect()
}

fn build(config: &GruConfig, ctx: &ExecContext) -> Gru {
    let mut gru = Gru::new(config.clone()).unwrap();
    gru.load_weights(GruWeights::synthetic(config, 42).unwrap()).unwrap();
    gru.create_pipeline(ctx).unwrap();
    gru
}

fn bench_hidden_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("gru_forward_f32");
    let ctx = ExecContext::new(RuntimeConfig::default()).unwrap();

    for &h in &[32usize, 128, 256, 512] {
        let i = h / 2;
        let config = GruConfig::new(h, i, Direction::Forward);
        let gru = build(&config, &ctx);
        let input = Tensor::from_f32_2d(i, STEPS, &gen_sequence(STEPS, i)).unwrap();

        group.throughput(Throughput::Elements(STEPS as u64));
        group.bench_with_input(BenchmarkId::new(ctx.isa().name(), h), &(), |b, _| {
            b.iter(|| gru.forward(&input, &ctx).unwrap());
        });
    }

    group.finish();
}

fn bench_scalar_vs_vector(c: &mut Criterion) {
    let mut group = c.benchmark_group("gru_scalar_vs_vector");
    let (h, i) = (256, 128);
    let config = GruConfig::new(h, i, Direction::Forward);
    let values = gen_sequence(STEPS, i);

    for force_scalar in [true, false] {
        let ctx = ExecContext::new(RuntimeConfig {
            force_scalar,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let gru = build(&config, &ctx);
        let input = Tensor::from_f32_2d(i, STEPS, &values).unwrap();

        group.throughput(Throughput::Elements(STEPS as u64));
        group.bench_with_input(BenchmarkId::new(ctx.isa().name(), h), &(), |b, _| {
            b.iter(|| gru.forward(&input, &ctx).unwrap());
        });
    }

    group.finish();
}

fn bench_precisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("gru_precision");
    let (h, i) = (256, 128);
    let values = gen_sequence(STEPS, i);

    let cases: &[(&str, ElemType, bool)] = &[
        ("fp32", ElemType::F32, false),
        ("fp16", ElemType::F16, false),
        ("bf16", ElemType::Bf16, false),
        ("int8", ElemType::F32, true),
    ];

    for &(label, elem, int8) in cases {
        let ctx = ExecContext::new(RuntimeConfig {
            use_fp16_storage: elem == ElemType::F16,
            use_bf16_storage: elem == ElemType::Bf16,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let config = GruConfig::new(h, i, Direction::Bidirectional).with_int8(int8);
        let gru = build(&config, &ctx);
        let input = Tensor::from_f32_2d(i, STEPS, &values)
            .unwrap()
            .cast(elem, &ctx.blob_alloc)
            .unwrap();

        group.throughput(Throughput::Elements(STEPS as u64));
        group.bench_with_input(BenchmarkId::new(label, h), &(), |b, _| {
            b.iter(|| gru.forward(&input, &ctx).unwrap());
        });
    }

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("gru_create_pipeline");
    let ctx = ExecContext::new(RuntimeConfig::reference()).unwrap();

    for int8 in [false, true] {
        let config = GruConfig::new(512, 256, Direction::Bidirectional).with_int8(int8);
        let weights = GruWeights::synthetic(&config, 42).unwrap();
        let mut gru = Gru::new(config).unwrap();
        gru.load_weights(weights).unwrap();

        let label = if int8 { "int8" } else { "fp32" };
        group.bench_function(label, |b| {
            b.iter(|| gru.create_pipeline(&ctx).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_hidden_sizes,
    bench_scalar_vs_vector,
    bench_precisions,
    bench_pipeline
);
criterion_main!(benches);
