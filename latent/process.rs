//! A single latent process: operator, mixing variable, state, and the
//! regression coefficients of its node-wise mean and log scale.
//!
//! Parameter layout is `[θ_K, θ_mu, θ_sigma, θ_V]`. Every gradient block is a
//! descent direction for the negative log-likelihood, so `θ ← θ - step ⊙ g`
//! raises the likelihood. Denominators of the Newton ratios use the lagged
//! draws `prevW`/`prevV`, never the draw that produced the numerator.

use crate::errors::{ConfigurationError, NumericalFailure};
use crate::latent::mixing::Mixing;
use crate::latent::operator::{DerivativeMode, Operator};
use crate::linalg::faer_ndarray::FaerCholesky;
use crate::linalg::sparse::{LuFactor, matvec};
use crate::linalg::{LinalgError, SparseMatrix};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip, s};
use rand::rngs::StdRng;
use serde::Serialize;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterBlock {
    Operator,
    Mean,
    Scale,
    Shape,
}

impl ParameterBlock {
    pub const ALL: [ParameterBlock; 4] = [
        ParameterBlock::Operator,
        ParameterBlock::Mean,
        ParameterBlock::Scale,
        ParameterBlock::Shape,
    ];

    fn index(self) -> usize {
        match self {
            ParameterBlock::Operator => 0,
            ParameterBlock::Mean => 1,
            ParameterBlock::Scale => 2,
            ParameterBlock::Shape => 3,
        }
    }
}

/// Everything needed to construct a [`LatentProcess`].
pub struct ProcessSetup {
    pub name: String,
    pub operator: Operator,
    pub mixing: Mixing,
    pub a: SparseMatrix,
    pub b_mu: Array2<f64>,
    pub b_sigma: Array2<f64>,
    pub theta_k: Array1<f64>,
    pub theta_mu: Array1<f64>,
    pub theta_sigma: Array1<f64>,
    pub w: Option<Array1<f64>>,
    /// Starting mixing variables; drawn from the prior when absent.
    pub v: Option<Array1<f64>>,
    pub fixed: [bool; 4],
    pub fix_w: bool,
    pub numer_grad: bool,
    pub use_precond: bool,
    pub rng: StdRng,
}

/// Operator quantities at `θ_K + ε e_j`, used by the preconditioned analytic gradient.
#[derive(Debug, Clone)]
struct ShiftedOperator {
    k: SparseMatrix,
    dk: SparseMatrix,
    trace: f64,
}

/// Natural-scale summary of one process.
#[derive(Debug, Clone, Serialize)]
pub struct LatentEstimate {
    pub name: String,
    pub operator: String,
    pub operator_parameters: Vec<f64>,
    pub theta_mu: Vec<f64>,
    pub theta_sigma: Vec<f64>,
    pub nu: Option<f64>,
}

pub struct LatentProcess {
    name: String,
    operator: Operator,
    mixing: Mixing,
    a: SparseMatrix,
    b_mu: Array2<f64>,
    b_sigma: Array2<f64>,

    theta_k: Array1<f64>,
    theta_mu: Array1<f64>,
    theta_sigma: Array1<f64>,

    mu: Array1<f64>,
    sigma: Array1<f64>,
    k: SparseMatrix,
    dk: Vec<SparseMatrix>,
    trace: Array1<f64>,
    shifted: Vec<ShiftedOperator>,

    w: Array1<f64>,
    prev_w: Array1<f64>,

    fixed: [bool; 4],
    fix_w: bool,
    v_supplied: bool,
    numer_grad: bool,
    use_precond: bool,
    rng: StdRng,
}

fn expect_len(context: &str, expected: usize, found: usize) -> Result<(), ConfigurationError> {
    if expected != found {
        return Err(ConfigurationError::DimensionMismatch {
            context: context.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Solves the Newton system `H x = grad` for a negative-definite `H` by
/// factoring `-H`; `None` when `-H` is not positive definite.
fn newton_direction(neg_hessian: &Array2<f64>, grad: &Array1<f64>) -> Option<Array1<f64>> {
    let factor = neg_hessian.cholesky(Side::Lower).ok()?;
    let solution = factor.solve_vec(grad);
    solution.iter().all(|v| v.is_finite()).then(|| -solution)
}

impl LatentProcess {
    pub fn new(setup: ProcessSetup) -> Result<Self, ConfigurationError> {
        let ProcessSetup {
            name,
            operator,
            mut mixing,
            a,
            b_mu,
            b_sigma,
            theta_k,
            theta_mu,
            theta_sigma,
            w,
            v,
            mut fixed,
            fix_w,
            numer_grad,
            use_precond,
            rng,
        } = setup;

        let n = operator.n_mesh();
        expect_len(&format!("columns of A for latent '{name}'"), n, a.ncols())?;
        expect_len(&format!("offset h for latent '{name}'"), n, mixing.len())?;
        expect_len(&format!("rows of B_mu for latent '{name}'"), n, b_mu.nrows())?;
        expect_len(&format!("rows of B_sigma for latent '{name}'"), n, b_sigma.nrows())?;
        let counts = [
            ("theta_k", operator.n_params(), theta_k.len()),
            ("theta_mu", b_mu.ncols(), theta_mu.len()),
            ("theta_sigma", b_sigma.ncols(), theta_sigma.len()),
        ];
        for (what, expected, found) in counts {
            if expected != found {
                return Err(ConfigurationError::ParameterCount {
                    context: format!("{what} of latent '{name}'"),
                    expected,
                    found,
                });
            }
        }
        if let Some(w) = &w {
            expect_len(&format!("starting W of latent '{name}'"), n, w.len())?;
        }
        let v_supplied = v.is_some();
        if let Some(v) = v {
            if mixing.is_gaussian() {
                return Err(ConfigurationError::Invalid {
                    context: format!("starting V of latent '{name}'"),
                    reason: "normal mixing keeps V at the offset h".to_string(),
                });
            }
            expect_len(&format!("starting V of latent '{name}'"), n, v.len())?;
            if let Some(bad) = v.iter().position(|&x| !(x > 0.0 && x.is_finite())) {
                return Err(ConfigurationError::Invalid {
                    context: format!("starting V of latent '{name}'"),
                    reason: format!("entry {bad} is {}, mixing variables must be positive", v[bad]),
                });
            }
            mixing.reset_v(v);
        }

        if mixing.is_gaussian() {
            fixed[ParameterBlock::Mean.index()] = true;
            fixed[ParameterBlock::Shape.index()] = true;
        }

        let w = w.unwrap_or_else(|| Array1::zeros(n));
        let mut process = Self {
            mu: b_mu.dot(&theta_mu),
            sigma: b_sigma.dot(&theta_sigma).mapv(f64::exp),
            k: operator
                .build(theta_k.view())
                .map_err(|source| ConfigurationError::Matrix {
                    context: format!("operator of latent '{name}'"),
                    source,
                })?,
            dk: Vec::new(),
            trace: Array1::zeros(theta_k.len()),
            shifted: Vec::new(),
            prev_w: w.clone(),
            w,
            name,
            operator,
            mixing,
            a,
            b_mu,
            b_sigma,
            theta_k,
            theta_mu,
            theta_sigma,
            fixed,
            fix_w,
            v_supplied,
            numer_grad,
            use_precond,
            rng,
        };
        process.refresh().map_err(|failure| ConfigurationError::Invalid {
            context: format!("starting operator of latent '{}'", process.name),
            reason: failure.to_string(),
        })?;
        Ok(process)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_mesh(&self) -> usize {
        self.operator.n_mesh()
    }

    /// Lengths of the four parameter blocks.
    pub fn block_sizes(&self) -> [usize; 4] {
        [
            self.operator.n_params(),
            self.b_mu.ncols(),
            self.b_sigma.ncols(),
            1,
        ]
    }

    pub fn n_params(&self) -> usize {
        self.block_sizes().iter().sum()
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn mixing(&self) -> &Mixing {
        &self.mixing
    }

    pub fn mixing_mut(&mut self) -> &mut Mixing {
        &mut self.mixing
    }

    pub fn a(&self) -> &SparseMatrix {
        &self.a
    }

    pub fn k(&self) -> &SparseMatrix {
        &self.k
    }

    pub fn dk(&self) -> &[SparseMatrix] {
        &self.dk
    }

    pub fn w(&self) -> &Array1<f64> {
        &self.w
    }

    pub fn prev_w(&self) -> &Array1<f64> {
        &self.prev_w
    }

    pub fn mu(&self) -> &Array1<f64> {
        &self.mu
    }

    pub fn sigma(&self) -> &Array1<f64> {
        &self.sigma
    }

    /// Moves the current state into `prevW` and stores `w`, unless `W` is pinned.
    pub fn set_w(&mut self, w: Array1<f64>) {
        if self.fix_w {
            self.prev_w.assign(&self.w);
        } else {
            self.prev_w = std::mem::replace(&mut self.w, w);
        }
    }

    pub fn freeze(&mut self, block: ParameterBlock) {
        self.fixed[block.index()] = true;
    }

    pub fn unfreeze(&mut self, block: ParameterBlock) {
        self.fixed[block.index()] = false;
    }

    pub fn is_frozen(&self, block: ParameterBlock) -> bool {
        self.fixed[block.index()]
    }

    /// `μ ⊙ (V - h)`.
    pub fn mean_vector(&self) -> Array1<f64> {
        &self.mu * &(self.mixing.v() - self.mixing.h())
    }

    fn lagged_mean_vector(&self) -> Array1<f64> {
        &self.mu * &(self.mixing.prev_v() - self.mixing.h())
    }

    /// `σ² ⊙ V`.
    pub fn scaled_variance(&self) -> Array1<f64> {
        &self.sigma.mapv(|s| s * s) * self.mixing.v()
    }

    fn lagged_scaled_variance(&self) -> Array1<f64> {
        &self.sigma.mapv(|s| s * s) * self.mixing.prev_v()
    }

    /// Prior draw of `V` at construction, skipped when starting values were supplied.
    pub fn initialize_v(&mut self) -> Result<(), NumericalFailure> {
        if self.v_supplied {
            return Ok(());
        }
        self.sample_unconditional_v()
    }

    pub fn sample_unconditional_v(&mut self) -> Result<(), NumericalFailure> {
        let context = format!("prior mixing variables of latent '{}'", self.name);
        self.mixing
            .sample_unconditional(&mut self.rng)
            .map_err(|source| NumericalFailure::gig(context, source))
    }

    /// Gibbs update of `V | W` from the residual `K W + μ h`.
    pub fn sample_conditional_v(&mut self) -> Result<(), NumericalFailure> {
        if self.mixing.is_gaussian() {
            return Ok(());
        }
        let kw = matvec(&self.k, self.w.view());
        let shifted = &kw + &(&self.mu * self.mixing.h());
        let a_increment = Zip::from(&self.mu)
            .and(&self.sigma)
            .map_collect(|&m, &s| (m / s).powi(2));
        let b_increment = Zip::from(&shifted)
            .and(&self.sigma)
            .map_collect(|&r, &s| (r / s).powi(2));
        let context = format!("conditional mixing variables of latent '{}'", self.name);
        self.mixing
            .sample_conditional(a_increment.view(), b_increment.view(), &mut self.rng)
            .map_err(|source| NumericalFailure::gig(context, source))
    }

    pub fn parameter(&self) -> Array1<f64> {
        let mut theta = Array1::zeros(self.n_params());
        let [nk, nm, ns, _] = self.block_sizes();
        theta.slice_mut(s![..nk]).assign(&self.theta_k);
        theta.slice_mut(s![nk..nk + nm]).assign(&self.theta_mu);
        theta.slice_mut(s![nk + nm..nk + nm + ns]).assign(&self.theta_sigma);
        theta[nk + nm + ns] = self.mixing.theta_nu();
        theta
    }

    /// Writes each unfrozen block of `theta`, then rebuilds `μ`, `σ`, `K`, `∂K` and the trace terms.
    pub fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) -> Result<(), NumericalFailure> {
        let [nk, nm, ns, _] = self.block_sizes();
        if !self.is_frozen(ParameterBlock::Operator) {
            self.theta_k.assign(&theta.slice(s![..nk]));
        }
        if !self.is_frozen(ParameterBlock::Mean) {
            self.theta_mu.assign(&theta.slice(s![nk..nk + nm]));
        }
        if !self.is_frozen(ParameterBlock::Scale) {
            self.theta_sigma.assign(&theta.slice(s![nk + nm..nk + nm + ns]));
        }
        if !self.is_frozen(ParameterBlock::Shape) {
            self.mixing.set_theta_nu(theta[nk + nm + ns]);
        }
        self.refresh()
    }

    fn operator_failure(&self, what: &str, source: LinalgError) -> NumericalFailure {
        NumericalFailure::factorization(format!("{what} of latent '{}'", self.name), source)
    }

    fn refresh(&mut self) -> Result<(), NumericalFailure> {
        self.mu = self.b_mu.dot(&self.theta_mu);
        self.sigma = self.b_sigma.dot(&self.theta_sigma).mapv(f64::exp);
        self.k = self
            .operator
            .build(self.theta_k.view())
            .map_err(|e| self.operator_failure("operator K", e))?;
        self.dk = (0..self.operator.n_params())
            .map(|j| self.operator.derivative(j, self.theta_k.view()))
            .collect::<Result<_, _>>()
            .map_err(|e| self.operator_failure("operator derivative dK", e))?;
        if !self.numer_grad && !self.is_frozen(ParameterBlock::Operator) {
            self.compute_trace()?;
        }
        Ok(())
    }

    /// `tr(K^{-1} ∂K_j)` for every operator parameter, and the same at `θ_K + ε e_j`
    /// when the Newton-preconditioned gradient is requested.
    fn compute_trace(&mut self) -> Result<(), NumericalFailure> {
        let lu = LuFactor::new(&self.k).map_err(|e| self.operator_failure("operator K", e))?;
        let trace = self
            .dk
            .iter()
            .map(|dk| lu.trace_inverse_product(dk))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.operator_failure("operator K", e))?;
        self.trace = Array1::from(trace);
        log::debug!("Latent '{}': trace terms {:?}", self.name, self.trace.to_vec());

        self.shifted.clear();
        if self.use_precond {
            let eps = self.operator.eps();
            for j in 0..self.operator.n_params() {
                let mut moved = self.theta_k.clone();
                moved[j] += eps;
                let shifted = self
                    .shifted_operator(j, moved.view())
                    .map_err(|e| self.operator_failure("shifted operator K", e))?;
                self.shifted.push(shifted);
            }
        }
        Ok(())
    }

    fn shifted_operator(&self, index: usize, theta: ArrayView1<'_, f64>) -> Result<ShiftedOperator, LinalgError> {
        let k = self.operator.build(theta)?;
        let dk = self.operator.derivative(index, theta)?;
        let trace = LuFactor::new(&k)?.trace_inverse_product(&dk)?;
        Ok(ShiftedOperator { k, dk, trace })
    }

    /// Concatenated descent directions for the four blocks; frozen blocks are exactly zero.
    pub fn gradient(&self) -> Result<Array1<f64>, NumericalFailure> {
        let [nk, nm, ns, _] = self.block_sizes();
        let mut grad = Array1::zeros(self.n_params());
        if !self.is_frozen(ParameterBlock::Operator) {
            let g = if self.numer_grad {
                self.numerical_grad_theta_k()?
            } else {
                self.grad_theta_k()
            };
            grad.slice_mut(s![..nk]).assign(&g);
        }
        if !self.is_frozen(ParameterBlock::Mean) {
            grad.slice_mut(s![nk..nk + nm]).assign(&self.grad_theta_mu());
        }
        if !self.is_frozen(ParameterBlock::Scale) {
            grad.slice_mut(s![nk + nm..nk + nm + ns]).assign(&self.grad_theta_sigma());
        }
        if !self.is_frozen(ParameterBlock::Shape) {
            grad[nk + nm + ns] = self.mixing.grad_theta_nu();
        }
        Ok(grad)
    }

    /// `∂/∂θ_j log p(W | V) = tr(K^{-1} ∂K_j) - Σ (∂K_j W)(K W - m) / SV`.
    fn score_theta_k(
        k: &SparseMatrix,
        dk: &SparseMatrix,
        trace: f64,
        w: ArrayView1<'_, f64>,
        mean: &Array1<f64>,
        sv: &Array1<f64>,
    ) -> f64 {
        let residual = matvec(k, w) - mean;
        let dkw = matvec(dk, w);
        let quadratic = Zip::from(&dkw)
            .and(&residual)
            .and(sv)
            .fold(0.0, |acc, &d, &r, &v| acc + d * r / v);
        trace - quadratic
    }

    fn grad_theta_k(&self) -> Array1<f64> {
        let n = self.n_mesh() as f64;
        let mean = self.mean_vector();
        let sv = self.scaled_variance();
        let prev_mean = self.lagged_mean_vector();
        let prev_sv = self.lagged_scaled_variance();
        let mut out = Array1::zeros(self.operator.n_params());
        for (j, dk) in self.dk.iter().enumerate() {
            let grad = Self::score_theta_k(&self.k, dk, self.trace[j], self.w.view(), &mean, &sv);
            out[j] = match self.shifted.get(j) {
                Some(shifted) => {
                    let at = Self::score_theta_k(&self.k, dk, self.trace[j], self.prev_w.view(), &prev_mean, &prev_sv);
                    let moved = Self::score_theta_k(
                        &shifted.k,
                        &shifted.dk,
                        shifted.trace,
                        self.prev_w.view(),
                        &prev_mean,
                        &prev_sv,
                    );
                    let hess = (moved - at) / self.operator.eps();
                    // A non-negative curvature estimate carries no Newton information.
                    if hess < 0.0 { grad / hess } else { -grad / n }
                }
                None => -grad / n,
            };
        }
        out
    }

    /// `½ log|KᵀSV⁻¹K| - ½ Σ (K W - m)² / SV` at operator parameters `theta`.
    ///
    /// The determinant splits as `log|det K| - ½ Σ log SV`, taken from the LU of `K`.
    pub fn function_k(&self, theta: ArrayView1<'_, f64>) -> Result<f64, NumericalFailure> {
        let k = self
            .operator
            .build(theta)
            .map_err(|e| self.operator_failure("operator K", e))?;
        let sv = self.scaled_variance();
        let inv_sv = sv.mapv(f64::recip);
        let log_det = LuFactor::new(&k)
            .and_then(|lu| lu.log_abs_det())
            .map_err(|e| self.operator_failure("operator K", e))?
            - 0.5 * sv.mapv(f64::ln).sum();
        let residual = matvec(&k, self.w.view()) - self.mean_vector();
        let quadratic = Zip::from(&residual)
            .and(&inv_sv)
            .fold(0.0, |acc, &r, &iv| acc + r * r * iv);
        Ok(log_det - 0.5 * quadratic)
    }

    fn numerical_grad_theta_k(&self) -> Result<Array1<f64>, NumericalFailure> {
        let n = self.n_mesh() as f64;
        let eps = self.operator.eps();
        let base = self.function_k(self.theta_k.view())?;
        let mut out = Array1::zeros(self.operator.n_params());
        for j in 0..self.operator.n_params() {
            let mut plus = self.theta_k.clone();
            plus[j] += eps;
            let f_plus = self.function_k(plus.view())?;
            let num_g = (f_plus - base) / eps;
            out[j] = if self.use_precond {
                let mut minus = self.theta_k.clone();
                minus[j] -= eps;
                let f_minus = self.function_k(minus.view())?;
                let num_hess = (f_plus + f_minus - 2.0 * base) / (eps * eps);
                if num_hess < 0.0 { num_g / num_hess } else { -num_g / n }
            } else {
                -num_g / n
            };
        }
        Ok(out)
    }

    /// Newton step for `θ_mu`; the curvature uses `prevV`.
    fn grad_theta_mu(&self) -> Array1<f64> {
        let n = self.n_mesh() as f64;
        let v_minus_h = self.mixing.v() - self.mixing.h();
        let prev_v_minus_h = self.mixing.prev_v() - self.mixing.h();
        let residual = matvec(&self.k, self.w.view()) - self.mean_vector();
        let sv = self.scaled_variance();
        let prev_sv = self.lagged_scaled_variance();

        let weights = Zip::from(&v_minus_h)
            .and(&residual)
            .and(&sv)
            .map_collect(|&d, &r, &v| d * r / v);
        let grad = self.b_mu.t().dot(&weights);

        let curvature = Zip::from(&prev_v_minus_h)
            .and(&prev_sv)
            .map_collect(|&d, &v| d * d / v);
        let neg_hessian = self.b_mu.t().dot(&(&self.b_mu * &curvature.insert_axis(Axis(1))));
        newton_direction(&neg_hessian, &grad).unwrap_or_else(|| -grad / n)
    }

    /// Step for `θ_sigma`: the ratio `grad / (hess σ + grad)` for a single
    /// constant basis column, a Newton solve otherwise.
    fn grad_theta_sigma(&self) -> Array1<f64> {
        let n = self.n_mesh() as f64;
        let residual = matvec(&self.k, self.w.view()) - self.mean_vector();
        let prev_residual = matvec(&self.k, self.prev_w.view()) - self.lagged_mean_vector();
        let vsq = Zip::from(&residual)
            .and(self.mixing.v())
            .map_collect(|&r, &v| r * r / v);
        let prev_vsq = Zip::from(&prev_residual)
            .and(self.mixing.prev_v())
            .map_collect(|&r, &v| r * r / v);

        let stationary = self.b_sigma.ncols() == 1 && self.b_sigma.iter().all(|&b| b == 1.0);
        if stationary {
            let sigma = self.sigma[0];
            let msq = vsq.sum();
            let msq2 = prev_vsq.sum();
            let grad = -n / sigma + msq / sigma.powi(3);
            let hess = n / (sigma * sigma) - 3.0 * msq2 / sigma.powi(4);
            return Array1::from_elem(1, grad / (hess * sigma + grad));
        }

        let sigma_sq = self.sigma.mapv(|s| s * s);
        let grad = self.b_sigma.t().dot(&(&vsq / &sigma_sq - 1.0));
        let curvature = 2.0 * &prev_vsq / &sigma_sq;
        let neg_hessian = self
            .b_sigma
            .t()
            .dot(&(&self.b_sigma * &curvature.insert_axis(Axis(1))));
        newton_direction(&neg_hessian, &grad).unwrap_or_else(|| -grad / n)
    }

    /// `log p(W | V) + log p(V)` at the current state.
    pub fn log_density(&self) -> Result<f64, NumericalFailure> {
        let n = self.n_mesh() as f64;
        let log_det = LuFactor::new(&self.k)
            .and_then(|lu| lu.log_abs_det())
            .map_err(|e| self.operator_failure("operator K", e))?;
        let sv = self.scaled_variance();
        let residual = matvec(&self.k, self.w.view()) - self.mean_vector();
        let quadratic = Zip::from(&residual).and(&sv).fold(0.0, |acc, &r, &v| acc + r * r / v);
        let log_sv = sv.mapv(f64::ln).sum();
        Ok(log_det - 0.5 * log_sv - 0.5 * quadratic - 0.5 * n * (2.0 * PI).ln() + self.mixing.log_density())
    }

    pub fn estimate(&self) -> LatentEstimate {
        LatentEstimate {
            name: self.name.clone(),
            operator: self.operator.kind().to_string(),
            operator_parameters: self.operator.natural_parameters(self.theta_k.view()).to_vec(),
            theta_mu: self.theta_mu.to_vec(),
            theta_sigma: self.theta_sigma.to_vec(),
            nu: (!self.mixing.is_gaussian()).then(|| self.mixing.nu()),
        }
    }

    pub fn derivative_mode(&self) -> DerivativeMode {
        self.operator.derivative_mode()
    }
}
