use canon_ml::canon::{gumbel_sinkhorn, sinkhorn, FrameBuilder, SoftPermutation};
use canon_ml::utils::random_set;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn bench_soft_sort(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let x = random_set((32, 16, 64), &mut rng);
    let score = Array2::from_shape_simple_fn((32, 16), || rng.gen::<f32>());
    let engine = SoftPermutation::new(0.1).unwrap();

    c.bench_function("soft_sort_forward", |b| {
        b.iter(|| engine.forward_transform(black_box(&x), black_box(&score)).unwrap())
    });

    let grad = Array3::ones(x.raw_dim());
    c.bench_function("soft_sort_forward_backward", |b| {
        b.iter(|| engine.forward_backward(black_box(&x), &score, &grad).unwrap())
    });
}

fn bench_sinkhorn(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let log_alpha = random_set((32, 16, 16), &mut rng);

    c.bench_function("sinkhorn_20_iter", |b| {
        b.iter(|| sinkhorn(black_box(&log_alpha), 20, 0.1).unwrap())
    });
    c.bench_function("gumbel_sinkhorn_20_iter", |b| {
        b.iter(|| gumbel_sinkhorn(black_box(&log_alpha), 1.0, 20, true, &mut rng).unwrap())
    });
}

fn bench_frames(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let vectors = random_set((256, 3, 3), &mut rng);
    let builder = FrameBuilder::default();

    c.bench_function("gram_schmidt_256", |b| {
        b.iter(|| builder.orthonormalize(black_box(&vectors)).unwrap())
    });
}

criterion_group!(benches, bench_soft_sort, bench_sinkhorn, bench_frames);
criterion_main!(benches);
