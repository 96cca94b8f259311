use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use ngme::block::{BlockModel, BlockSetup};
use ngme::config::ModelControl;
use ngme::latent::{LatentProcess, Mixing, MixingFamily, Operator, ProcessSetup};
use ngme::linalg::sparse::{self, from_triplets};
use ngme::noise::MeasurementNoise;
use ngme::random::{standard_normal_vector, stream};

/// One-dimensional Matérn mesh with `n` nodes: stiffness `G`, lumped mass `C`.
fn matern_process(n: usize, seed: u64) -> LatentProcess {
    let mut g = Vec::new();
    for i in 0..n {
        let degree = if i == 0 || i + 1 == n { 1.0 } else { 2.0 };
        g.push((i, i, degree));
        if i + 1 < n {
            g.push((i, i + 1, -1.0));
            g.push((i + 1, i, -1.0));
        }
    }
    let c: Vec<_> = (0..n).map(|i| (i, i, if i == 0 || i + 1 == n { 0.5 } else { 1.0 })).collect();
    let operator = Operator::matern(from_triplets(n, n, &g).unwrap(), from_triplets(n, n, &c).unwrap(), 2).unwrap();
    LatentProcess::new(ProcessSetup {
        name: "field".to_string(),
        operator,
        mixing: Mixing::nig(Array1::ones(n), 0.0),
        a: sparse::identity(n).unwrap(),
        b_mu: Array2::ones((n, 1)),
        b_sigma: Array2::ones((n, 1)),
        theta_k: Array1::from(vec![-1.0]),
        theta_mu: Array1::zeros(1),
        theta_sigma: Array1::zeros(1),
        w: None,
        v: None,
        fixed: [false; 4],
        fix_w: false,
        numer_grad: false,
        use_precond: false,
        rng: stream(seed, 1),
    })
    .unwrap()
}

fn model(n: usize) -> BlockModel {
    let y = standard_normal_vector(n, &mut stream(0x5EED, 7));
    BlockModel::new(BlockSetup {
        y,
        x: Array2::zeros((n, 0)),
        beta: Array1::zeros(0),
        processes: vec![matern_process(n, 0x5EED)],
        noise: MeasurementNoise::new(MixingFamily::Normal, n, 0.0, -1.0, 0.0, stream(0x5EED, 2)),
        control: ModelControl {
            n_gibbs: 1,
            burn_in: 0,
            ..ModelControl::default()
        },
        seed: 0x5EED,
    })
    .unwrap()
}

fn benchmark_gibbs_sweep(c: &mut Criterion) {
    let sizes = [100_usize, 400, 1600];
    let mut group = c.benchmark_group("gibbs_sweep");
    for &size in &sizes {
        group.throughput(Throughput::Elements(size as u64));
        let mut sweep_model = model(size);
        group.bench_function(BenchmarkId::new("sample_v_then_w", size), |b| {
            b.iter(|| {
                sweep_model.sample_v().unwrap();
                sweep_model.sample_w().unwrap();
                black_box(sweep_model.w());
            });
        });

        let mut gradient_model = model(size);
        group.bench_function(BenchmarkId::new("gradient", size), |b| {
            b.iter(|| {
                black_box(gradient_model.gradient().unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(gibbs_sweep, benchmark_gibbs_sweep);
criterion_main!(gibbs_sweep);
