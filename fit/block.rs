// fit/block.rs

//! # Block model
//!
//! Couples the observations `Y = X β + Σ_i A_i W_i + ε` with the stacked latent
//! processes and the measurement noise, and runs the Gibbs sampler that drives
//! the Monte-Carlo gradient:
//!
//! 1.  `sample_v`: every process draws `V | W` on its own random stream (in
//!     parallel), then the NIG noise mixing variables are drawn from the
//!     realized residual.
//! 2.  `sample_w`: the joint precision `Q = KᵀSV⁻¹K + AᵀΣε⁻¹A` is
//!     factorized, reusing its symbolic analysis, and `W` is drawn as one solve
//!     against the mean term plus a whitened perturbation.
//! 3.  `gradient`: the per-sweep gradients of `n_gibbs` sweeps are
//!     averaged; the optional step/freeze controller is applied to the average.
//!
//! The joint parameter vector is ordered as each process's
//! `[θ_K, θ_mu, θ_sigma, θ_V]`, then `β`, then the noise parameters.

use crate::config::ModelControl;
use crate::errors::{ConfigurationError, FitError, NumericalFailure};
use crate::latent::{LatentEstimate, LatentProcess, ParameterBlock};
use crate::linalg::faer_ndarray::FaerCholesky;
use crate::linalg::sparse::{self, matvec, transpose_matvec};
use crate::linalg::{LinalgError, SparseCholesky, SparseMatrix};
use crate::noise::MeasurementNoise;
use crate::optimizer::StochasticModel;
use crate::random::{standard_normal_vector, stream};
use crate::schedule::{BlockSlot, StepSchedule};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use rand::rngs::StdRng;
use rayon::prelude::*;

const JOINT_PRECISION: &str = "joint precision Q = KᵀSV⁻¹K + AᵀΣε⁻¹A";

/// Everything needed to construct a [`BlockModel`].
pub struct BlockSetup {
    pub y: Array1<f64>,
    pub x: Array2<f64>,
    pub beta: Array1<f64>,
    pub processes: Vec<LatentProcess>,
    pub noise: MeasurementNoise,
    pub control: ModelControl,
    pub seed: u64,
}

pub struct BlockModel {
    y: Array1<f64>,
    x: Array2<f64>,
    beta: Array1<f64>,
    processes: Vec<LatentProcess>,
    noise: MeasurementNoise,

    a: SparseMatrix,
    k: SparseMatrix,
    k_dirty: bool,
    solver: SparseCholesky,

    control: ModelControl,
    schedule: Option<StepSchedule>,
    rng: StdRng,
    iteration: usize,
}

impl BlockModel {
    pub fn new(setup: BlockSetup) -> Result<Self, FitError> {
        let BlockSetup {
            y,
            x,
            beta,
            processes,
            noise,
            control,
            seed,
        } = setup;

        let n_obs = y.len();
        if n_obs == 0 {
            return Err(ConfigurationError::Invalid {
                context: "observations Y".to_string(),
                reason: "at least one observation is required".to_string(),
            }
            .into());
        }
        if processes.is_empty() {
            return Err(ConfigurationError::Invalid {
                context: "latent processes".to_string(),
                reason: "at least one latent process is required".to_string(),
            }
            .into());
        }
        control.validate()?;
        let dimension = |context: String, expected: usize, found: usize| -> Result<(), FitError> {
            if expected == found {
                Ok(())
            } else {
                Err(ConfigurationError::DimensionMismatch {
                    context,
                    expected,
                    found,
                }
                .into())
            }
        };
        dimension("rows of the fixed-effect design X".to_string(), n_obs, x.nrows())?;
        dimension("length of beta".to_string(), x.ncols(), beta.len())?;
        for process in &processes {
            dimension(format!("rows of A for latent '{}'", process.name()), n_obs, process.a().nrows())?;
        }
        dimension("measurement-noise length".to_string(), n_obs, noise.mixing().len())?;

        let a_blocks: Vec<&SparseMatrix> = processes.iter().map(|p| p.a()).collect();
        let a = sparse::hstack(&a_blocks).map_err(|source| ConfigurationError::Matrix {
            context: "joint observation matrix A".to_string(),
            source,
        })?;
        let k_blocks: Vec<&SparseMatrix> = processes.iter().map(|p| p.k()).collect();
        let k = sparse::block_diagonal(&k_blocks).map_err(|source| ConfigurationError::Matrix {
            context: "joint operator K".to_string(),
            source,
        })?;

        let schedule = control.examine_gradient.then(|| {
            let mut slots = Vec::new();
            let mut offset = 0;
            for (index, process) in processes.iter().enumerate() {
                for (block, size) in ParameterBlock::ALL.into_iter().zip(process.block_sizes()) {
                    slots.push(BlockSlot {
                        process: index,
                        block,
                        range: offset..offset + size,
                    });
                    offset += size;
                }
            }
            let n_params = offset + beta.len() + noise.n_params();
            StepSchedule::new(control.schedule(), n_params, slots)
        });

        let mut model = Self {
            y,
            x,
            beta,
            processes,
            noise,
            a,
            k,
            k_dirty: false,
            solver: SparseCholesky::new(JOINT_PRECISION),
            control,
            schedule,
            rng: stream(seed, 0),
            iteration: 0,
        };
        log::info!(
            "Block model: {} observations, {} latent processes (mesh sizes {:?}), {} parameters.",
            n_obs,
            model.processes.len(),
            model.processes.iter().map(|p| p.n_mesh()).collect::<Vec<_>>(),
            model.n_params()
        );

        model.initialize()?;
        Ok(model)
    }

    /// Prior draws of the mixing variables, a first `W`, and the burn-in sweeps.
    fn initialize(&mut self) -> Result<(), FitError> {
        for index in 0..self.processes.len() {
            let drawn = self.processes[index].initialize_v();
            drawn.map_err(|failure| self.fail(failure))?;
        }
        let drawn = self.noise.sample_unconditional_v();
        drawn.map_err(|failure| self.fail(failure))?;
        self.sample_w()?;
        for _ in 0..self.control.burn_in {
            self.sample_v()?;
            self.sample_w()?;
        }
        log::debug!("Completed {} burn-in sweeps.", self.control.burn_in);
        Ok(())
    }

    fn fail(&self, failure: NumericalFailure) -> FitError {
        FitError::Numerical {
            failure,
            parameters: self.parameter(),
        }
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_mesh_total(&self) -> usize {
        self.processes.iter().map(|p| p.n_mesh()).sum()
    }

    pub fn n_params(&self) -> usize {
        self.processes.iter().map(|p| p.n_params()).sum::<usize>() + self.beta.len() + self.noise.n_params()
    }

    pub fn processes(&self) -> &[LatentProcess] {
        &self.processes
    }

    pub fn process_mut(&mut self, index: usize) -> Option<&mut LatentProcess> {
        self.processes.get_mut(index)
    }

    pub fn noise(&self) -> &MeasurementNoise {
        &self.noise
    }

    pub fn noise_mut(&mut self) -> &mut MeasurementNoise {
        &mut self.noise
    }

    pub fn beta(&self) -> &Array1<f64> {
        &self.beta
    }

    pub fn a(&self) -> &SparseMatrix {
        &self.a
    }

    /// Number of outer gradient evaluations so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Number of symbolic analyses of the joint precision so far.
    pub fn symbolic_analyses(&self) -> usize {
        self.solver.analyses()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.n_params());
        for process in &self.processes {
            let labels = ["theta_k", "theta_mu", "theta_sigma", "theta_nu"];
            for (label, size) in labels.iter().zip(process.block_sizes()) {
                for j in 0..size {
                    names.push(format!("{}.{label}[{j}]", process.name()));
                }
            }
        }
        names.extend((0..self.beta.len()).map(|j| format!("beta[{j}]")));
        names.extend(self.noise.parameter_names().iter().map(|s| s.to_string()));
        names
    }

    fn stack(&self, part: impl Fn(&LatentProcess) -> Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.n_mesh_total());
        let mut offset = 0;
        for process in &self.processes {
            let block = part(process);
            out.slice_mut(s![offset..offset + block.len()]).assign(&block);
            offset += block.len();
        }
        out
    }

    /// Stacked latent state.
    pub fn w(&self) -> Array1<f64> {
        self.stack(|p| p.w().clone())
    }

    pub fn prev_w(&self) -> Array1<f64> {
        self.stack(|p| p.prev_w().clone())
    }

    /// Stacked latent mixing variables.
    pub fn v(&self) -> Array1<f64> {
        self.stack(|p| p.mixing().v().clone())
    }

    /// Overwrites the stacked latent state, keeping each process's lag.
    pub fn set_w(&mut self, w: ArrayView1<'_, f64>) -> Result<(), FitError> {
        if w.len() != self.n_mesh_total() {
            return Err(ConfigurationError::DimensionMismatch {
                context: "stacked latent state W".to_string(),
                expected: self.n_mesh_total(),
                found: w.len(),
            }
            .into());
        }
        let mut offset = 0;
        for process in &mut self.processes {
            let n = process.n_mesh();
            process.set_w(w.slice(s![offset..offset + n]).to_owned());
            offset += n;
        }
        Ok(())
    }

    /// `X β + A W` at the current state.
    pub fn fitted_values(&self) -> Array1<f64> {
        self.x.dot(&self.beta) + matvec(&self.a, self.w().view())
    }

    fn residual_for(&self, w: &Array1<f64>) -> Array1<f64> {
        &self.y - &matvec(&self.a, w.view()) - self.x.dot(&self.beta)
    }

    /// `Y - A W - X β`.
    pub fn residual(&self) -> Array1<f64> {
        self.residual_for(&self.w())
    }

    fn assemble(&mut self) -> Result<(), FitError> {
        if !self.k_dirty {
            return Ok(());
        }
        let blocks: Vec<&SparseMatrix> = self.processes.iter().map(|p| p.k()).collect();
        let assembled = sparse::block_diagonal(&blocks);
        self.k = assembled.map_err(|e| self.fail(NumericalFailure::factorization("joint operator K", e)))?;
        self.k_dirty = false;
        Ok(())
    }

    /// Draws `W | V, Y` from its Gaussian full conditional.
    pub fn sample_w(&mut self) -> Result<(), FitError> {
        self.assemble()?;
        let sv = self.stack(|p| p.scaled_variance());
        let mean = self.stack(|p| p.mean_vector());
        let noise_var = self.noise.variance();
        let target = &self.y - &self.x.dot(&self.beta) - self.noise.mean();

        let drawn = self.draw_w(&sv, &mean, &noise_var, &target);
        let w = drawn.map_err(|e| self.fail(NumericalFailure::factorization(JOINT_PRECISION, e)))?;
        self.set_w(w.view())
    }

    fn draw_w(
        &mut self,
        sv: &Array1<f64>,
        mean: &Array1<f64>,
        noise_var: &Array1<f64>,
        target: &Array1<f64>,
    ) -> Result<Array1<f64>, LinalgError> {
        let inv_sv = sv.mapv(f64::recip);
        let inv_noise = noise_var.mapv(f64::recip);
        let latent_precision = sparse::weighted_gram(&self.k, inv_sv.view())?;
        let data_precision = sparse::weighted_gram(&self.a, inv_noise.view())?;
        let q = sparse::linear_combination(&[(1.0, &latent_precision), (1.0, &data_precision)])?;

        let z_latent = standard_normal_vector(sv.len(), &mut self.rng);
        let z_data = standard_normal_vector(noise_var.len(), &mut self.rng);
        let latent_rhs = &inv_sv * mean + &z_latent * &inv_sv.mapv(f64::sqrt);
        let data_rhs = &inv_noise * target + &z_data * &inv_noise.mapv(f64::sqrt);
        let rhs = transpose_matvec(&self.k, latent_rhs.view()) + transpose_matvec(&self.a, data_rhs.view());

        let factor = self.solver.factorize(&q)?;
        factor.solve(rhs.view())
    }

    /// Draws every mixing variable given the current state.
    pub fn sample_v(&mut self) -> Result<(), FitError> {
        let sampled = self
            .processes
            .par_iter_mut()
            .try_for_each(|process| process.sample_conditional_v());
        sampled.map_err(|failure| self.fail(failure))?;
        let residual = self.residual();
        let sampled = self.noise.sample_v(residual.view());
        sampled.map_err(|failure| self.fail(failure))
    }

    /// GLS step for `β`: `-(XᵀΣ⁻¹X)⁻¹ XᵀΣ⁻¹ (Y - A W - m_ε - X β)`.
    fn grad_beta(&self, residual: &Array1<f64>) -> Result<Array1<f64>, NumericalFailure> {
        let p = self.beta.len();
        if p == 0 || self.control.fix_beta {
            return Ok(Array1::zeros(p));
        }
        let inv_var = self.noise.variance().mapv(f64::recip);
        let centred = residual - &self.noise.mean();
        let weighted_x = &self.x * &inv_var.view().insert_axis(Axis(1));
        let normal = self.x.t().dot(&weighted_x);
        let rhs = weighted_x.t().dot(&centred);
        let factor = normal.cholesky(Side::Lower).map_err(|e| {
            NumericalFailure::factorization("fixed-effect normal equations XᵀΣ⁻¹X", LinalgError::Dense(e))
        })?;
        Ok(-factor.solve_vec(&rhs))
    }

    fn sweep_gradient(&self) -> Result<Array1<f64>, NumericalFailure> {
        let latent: Vec<Array1<f64>> = self
            .processes
            .par_iter()
            .map(|process| process.gradient())
            .collect::<Result<_, _>>()?;
        let residual = self.residual();
        let prev_residual = self.residual_for(&self.prev_w());

        let mut grad = Array1::zeros(self.n_params());
        let mut offset = 0;
        for block in &latent {
            grad.slice_mut(s![offset..offset + block.len()]).assign(block);
            offset += block.len();
        }
        let beta_grad = self.grad_beta(&residual)?;
        grad.slice_mut(s![offset..offset + beta_grad.len()]).assign(&beta_grad);
        offset += beta_grad.len();
        let noise_grad = self.noise.gradient(residual.view(), prev_residual.view());
        grad.slice_mut(s![offset..]).assign(&noise_grad);
        Ok(grad)
    }

    /// Monte-Carlo average of the per-sweep gradient over `n_gibbs` sweeps.
    pub fn gradient(&mut self) -> Result<Array1<f64>, FitError> {
        self.iteration += 1;
        let mut total = Array1::<f64>::zeros(self.n_params());
        for _ in 0..self.control.n_gibbs {
            self.sample_v()?;
            self.sample_w()?;
            let sweep = self.sweep_gradient();
            total += &sweep.map_err(|failure| self.fail(failure))?;
        }
        let mut average = total / self.control.n_gibbs as f64;
        if self.schedule.is_some() {
            self.examine_gradient(&mut average);
        }
        Ok(average)
    }

    /// Updates the per-parameter step sizes and freezes quiet latent blocks.
    pub fn examine_gradient(&mut self, gradient: &mut Array1<f64>) {
        let Some(schedule) = self.schedule.as_mut() else {
            return;
        };
        let frozen: Vec<bool> = schedule
            .slots()
            .iter()
            .map(|slot| self.processes[slot.process].is_frozen(slot.block))
            .collect();
        for slot in schedule.examine(self.iteration, gradient, &frozen) {
            let process = &mut self.processes[slot.process];
            process.freeze(slot.block);
            gradient.slice_mut(s![slot.range.clone()]).fill(0.0);
            log::info!(
                "Iteration {}: froze {:?} block of latent '{}'.",
                self.iteration,
                slot.block,
                process.name()
            );
        }
    }

    pub fn step_sizes(&self) -> Option<Array1<f64>> {
        self.schedule.as_ref().map(|s| s.step_sizes().clone())
    }

    pub fn parameter(&self) -> Array1<f64> {
        let mut theta = Array1::zeros(self.n_params());
        let mut offset = 0;
        for process in &self.processes {
            let block = process.parameter();
            theta.slice_mut(s![offset..offset + block.len()]).assign(&block);
            offset += block.len();
        }
        theta.slice_mut(s![offset..offset + self.beta.len()]).assign(&self.beta);
        offset += self.beta.len();
        theta.slice_mut(s![offset..]).assign(&self.noise.parameter());
        theta
    }

    /// Writes the joint parameter vector; frozen blocks keep their values.
    pub fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) -> Result<(), FitError> {
        if theta.len() != self.n_params() {
            return Err(ConfigurationError::ParameterCount {
                context: "joint parameter vector".to_string(),
                expected: self.n_params(),
                found: theta.len(),
            }
            .into());
        }
        let mut offset = 0;
        for index in 0..self.processes.len() {
            let n = self.processes[index].n_params();
            let updated = self.processes[index].set_parameter(theta.slice(s![offset..offset + n]));
            if let Err(failure) = updated {
                return Err(FitError::Numerical {
                    failure,
                    parameters: theta.to_owned(),
                });
            }
            offset += n;
        }
        let p = self.beta.len();
        if !self.control.fix_beta {
            self.beta.assign(&theta.slice(s![offset..offset + p]));
        }
        offset += p;
        self.noise.set_parameter(theta.slice(s![offset..]));
        self.k_dirty = true;
        Ok(())
    }

    /// Joint log-density `log p(Y, W, V | θ)` at the current state.
    pub fn log_density(&self) -> Result<f64, FitError> {
        let mut total = 0.0;
        for process in &self.processes {
            total += process.log_density().map_err(|failure| self.fail(failure))?;
        }
        let residual = self.residual();
        Ok(total + self.noise.log_density(residual.view()))
    }

    pub fn estimates(&self) -> Vec<LatentEstimate> {
        self.processes.iter().map(|p| p.estimate()).collect()
    }
}

impl StochasticModel for BlockModel {
    fn parameter(&self) -> Array1<f64> {
        BlockModel::parameter(self)
    }

    fn gradient(&mut self) -> Result<Array1<f64>, FitError> {
        BlockModel::gradient(self)
    }

    fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) -> Result<(), FitError> {
        BlockModel::set_parameter(self, theta)
    }

    fn step_sizes(&self) -> Option<Array1<f64>> {
        BlockModel::step_sizes(self)
    }
}
