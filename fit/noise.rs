//! Measurement noise `ε = Y - A W - X β`.
//!
//! Normal noise has `ε_i ~ N(0, σ²)` with parameter `[log σ]`. NIG noise is the
//! variance mixture `ε_i | V_i ~ N(μ (V_i - 1), σ² V_i)` with
//! `V_i ~ GIG(-1/2, ν, ν)` and parameters `[μ, log σ, log ν]`.

use crate::errors::NumericalFailure;
use crate::latent::{Mixing, MixingFamily};
use ndarray::{Array1, ArrayView1, Zip};
use rand::rngs::StdRng;
use std::f64::consts::PI;

pub struct MeasurementNoise {
    mixing: Mixing,
    mu: f64,
    theta_sigma: f64,
    fixed: bool,
    rng: StdRng,
}

impl MeasurementNoise {
    pub fn new(family: MixingFamily, n_obs: usize, mu: f64, theta_sigma: f64, theta_nu: f64, rng: StdRng) -> Self {
        let h = Array1::ones(n_obs);
        let mixing = match family {
            MixingFamily::Normal => Mixing::normal(h),
            MixingFamily::Nig => Mixing::nig(h, theta_nu),
        };
        let mu = if family == MixingFamily::Normal { 0.0 } else { mu };
        Self {
            mixing,
            mu,
            theta_sigma,
            fixed: false,
            rng,
        }
    }

    pub fn family(&self) -> MixingFamily {
        self.mixing.family()
    }

    pub fn fix(&mut self) {
        self.fixed = true;
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn n_params(&self) -> usize {
        match self.family() {
            MixingFamily::Normal => 1,
            MixingFamily::Nig => 3,
        }
    }

    pub fn sigma(&self) -> f64 {
        self.theta_sigma.exp()
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    pub fn mixing(&self) -> &Mixing {
        &self.mixing
    }

    pub fn mixing_mut(&mut self) -> &mut Mixing {
        &mut self.mixing
    }

    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self.family() {
            MixingFamily::Normal => &["noise.theta_sigma"],
            MixingFamily::Nig => &["noise.mu", "noise.theta_sigma", "noise.theta_nu"],
        }
    }

    pub fn parameter(&self) -> Array1<f64> {
        match self.family() {
            MixingFamily::Normal => Array1::from(vec![self.theta_sigma]),
            MixingFamily::Nig => Array1::from(vec![self.mu, self.theta_sigma, self.mixing.theta_nu()]),
        }
    }

    pub fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) {
        if self.fixed {
            return;
        }
        match self.family() {
            MixingFamily::Normal => self.theta_sigma = theta[0],
            MixingFamily::Nig => {
                self.mu = theta[0];
                self.theta_sigma = theta[1];
                self.mixing.set_theta_nu(theta[2]);
            }
        }
    }

    /// `σ² V` per observation.
    pub fn variance(&self) -> Array1<f64> {
        let s2 = self.sigma().powi(2);
        self.mixing.v().mapv(|v| s2 * v)
    }

    /// `μ (V - 1)` per observation.
    pub fn mean(&self) -> Array1<f64> {
        let mu = self.mu;
        self.mixing.v().mapv(|v| mu * (v - 1.0))
    }

    /// Gibbs update of the noise mixing variables from the realized residual.
    pub fn sample_v(&mut self, residual: ArrayView1<'_, f64>) -> Result<(), NumericalFailure> {
        if self.family() == MixingFamily::Normal {
            return Ok(());
        }
        let sigma = self.sigma();
        let a_increment = Array1::from_elem(residual.len(), (self.mu / sigma).powi(2));
        let b_increment = residual.mapv(|r| ((r + self.mu) / sigma).powi(2));
        self.mixing
            .sample_conditional(a_increment.view(), b_increment.view(), &mut self.rng)
            .map_err(|source| NumericalFailure::gig("measurement-noise mixing variables", source))
    }

    pub fn sample_unconditional_v(&mut self) -> Result<(), NumericalFailure> {
        self.mixing
            .sample_unconditional(&mut self.rng)
            .map_err(|source| NumericalFailure::gig("prior measurement-noise mixing variables", source))
    }

    /// Sum of squared standardized residuals `Σ (r - μ (V - 1))² / V` for a given `V`.
    fn weighted_square_sum(&self, residual: ArrayView1<'_, f64>, v: &Array1<f64>) -> f64 {
        let mu = self.mu;
        Zip::from(&residual)
            .and(v)
            .fold(0.0, |acc, &r, &v| acc + (r - mu * (v - 1.0)).powi(2) / v)
    }

    /// Descent directions for the noise parameters.
    ///
    /// `residual` comes from the current state, `prev_residual` from the lagged
    /// `prevW`; the `log σ` ratio below keeps the lagged first-order term in its
    /// denominator, `hess·σ² + prevGrad`.
    pub fn gradient(&self, residual: ArrayView1<'_, f64>, prev_residual: ArrayView1<'_, f64>) -> Array1<f64> {
        if self.fixed {
            return Array1::zeros(self.n_params());
        }
        let n = residual.len() as f64;
        let sigma = self.sigma();
        let v = self.mixing.v();
        let prev_v = self.mixing.prev_v();

        let grad_theta = |square_sum: f64| sigma * (-n / sigma + square_sum / sigma.powi(3));
        let current = self.weighted_square_sum(residual, v);
        let lagged = self.weighted_square_sum(prev_residual, prev_v);
        let hess = n / (sigma * sigma) - 3.0 * lagged / sigma.powi(4);
        let g_sigma = grad_theta(current) / (hess * sigma * sigma + grad_theta(lagged));

        match self.family() {
            MixingFamily::Normal => Array1::from(vec![g_sigma]),
            MixingFamily::Nig => {
                let s2 = sigma * sigma;
                let mu = self.mu;
                let grad_mu = Zip::from(&residual)
                    .and(v)
                    .fold(0.0, |acc, &r, &v| acc + (v - 1.0) * (r - mu * (v - 1.0)) / (s2 * v));
                let hess_mu = -prev_v.iter().map(|&v| (v - 1.0).powi(2) / (s2 * v)).sum::<f64>();
                let g_mu = if hess_mu < 0.0 { grad_mu / hess_mu } else { -grad_mu / n };
                Array1::from(vec![g_mu, g_sigma, self.mixing.grad_theta_nu()])
            }
        }
    }

    /// `log p(ε | V) + log p(V)`.
    pub fn log_density(&self, residual: ArrayView1<'_, f64>) -> f64 {
        let variance = self.variance();
        let mean = self.mean();
        let gaussian = Zip::from(&residual)
            .and(&mean)
            .and(&variance)
            .fold(0.0, |acc, &r, &m, &s| acc - 0.5 * (2.0 * PI * s).ln() - 0.5 * (r - m).powi(2) / s);
        gaussian + self.mixing.log_density()
    }
}
