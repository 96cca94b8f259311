use ndarray::{Array1, Array2};
use ngme::block::{BlockModel, BlockSetup};
use ngme::config::ModelControl;
use ngme::latent::{LatentProcess, Mixing, MixingFamily, Operator, ProcessSetup, ar1_to_constrained};
use ngme::linalg::sparse::{self, from_triplets};
use ngme::noise::MeasurementNoise;
use ngme::optimizer::Optimizer;
use ngme::random::{standard_normal_vector, stream};
use rayon::prelude::*;

const TRUE_ALPHA: f64 = 0.7;
const NOISE_SIGMA: f64 = 0.1;
const PATH_LENGTH: usize = 50;
const ITERATIONS: usize = 500;

struct Simulated {
    w: Array1<f64>,
    y: Array1<f64>,
}

fn simulate(n: usize, seed: u64) -> Simulated {
    let z = standard_normal_vector(n, &mut stream(seed, 100));
    let e = standard_normal_vector(n, &mut stream(seed, 101));
    let mut w = Array1::zeros(n);
    w[0] = z[0];
    for i in 1..n {
        w[i] = TRUE_ALPHA * w[i - 1] + z[i];
    }
    let y = &w + &e.mapv(|v| NOISE_SIGMA * v);
    Simulated { w, y }
}

/// Conditional least-squares estimate of the AR(1) coefficient from the true path.
fn least_squares_alpha(w: &Array1<f64>) -> f64 {
    let n = w.len();
    let lagged = w.slice(ndarray::s![..n - 1]);
    let current = w.slice(ndarray::s![1..]);
    lagged.dot(&current) / lagged.dot(&lagged)
}

fn fit_alpha(seed: u64) -> (f64, f64) {
    let n = PATH_LENGTH;
    let data = simulate(n, seed);
    let g: Vec<_> = (0..n).map(|i| (i, i, 1.0)).collect();
    let c: Vec<_> = (1..n).map(|i| (i, i - 1, -1.0)).collect();
    let operator = Operator::ar1(from_triplets(n, n, &g).unwrap(), from_triplets(n, n, &c).unwrap()).unwrap();
    let process = LatentProcess::new(ProcessSetup {
        name: "ar1".to_string(),
        operator,
        mixing: Mixing::normal(Array1::ones(n)),
        a: sparse::identity(n).unwrap(),
        b_mu: Array2::ones((n, 1)),
        b_sigma: Array2::ones((n, 1)),
        theta_k: Array1::zeros(1),
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
    .unwrap();
    let noise = MeasurementNoise::new(MixingFamily::Normal, n, 0.0, NOISE_SIGMA.ln(), 0.0, stream(seed, 2));
    let mut model = BlockModel::new(BlockSetup {
        y: data.y,
        x: Array2::zeros((n, 0)),
        beta: Array1::zeros(0),
        processes: vec![process],
        noise,
        control: ModelControl {
            n_gibbs: 5,
            burn_in: 5,
            ..ModelControl::default()
        },
        seed,
    })
    .unwrap();

    let outcome = Optimizer::new(ITERATIONS, 1.0).run(&mut model).unwrap();
    assert_eq!(outcome.trajectory.len(), outcome.status.iterations);
    (ar1_to_constrained(outcome.parameter[0]), least_squares_alpha(&data.w))
}

#[test]
fn gaussian_ar1_coefficient_is_recovered() {
    let seeds: Vec<u64> = (21..41).collect();
    let fits: Vec<(f64, f64)> = seeds.par_iter().map(|&seed| fit_alpha(seed)).collect();
    let close = fits
        .iter()
        .filter(|(fitted, reference)| (fitted - reference).abs() < 0.05)
        .count();
    // At least 90% of the fits.
    assert!(
        10 * close >= 9 * seeds.len(),
        "only {close} of {} fits landed near the least-squares coefficient: {fits:?}",
        seeds.len()
    );
}
