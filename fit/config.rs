// fit/config.rs

//! The TOML payload a model is built from.
//!
//! Everything here is plain data with serde defaults; validation happens when
//! [`ModelSpec::build`] turns the payload into a [`BlockModel`].

use crate::block::{BlockModel, BlockSetup};
use crate::errors::{ConfigurationError, FitError};
use crate::latent::{DerivativeMode, LatentProcess, Mixing, MixingFamily, Operator, ProcessSetup};
use crate::linalg::SparseMatrix;
use crate::linalg::sparse::from_triplets;
use crate::noise::MeasurementNoise;
use crate::optimizer::Optimizer;
use crate::random::stream;
use crate::schedule::ScheduleSettings;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Sparse matrix as coordinate triplets; duplicate coordinates are summed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseSpec {
    pub nrows: usize,
    pub ncols: usize,
    #[serde(default)]
    pub rows: Vec<usize>,
    #[serde(default)]
    pub cols: Vec<usize>,
    #[serde(default)]
    pub values: Vec<f64>,
}

impl SparseSpec {
    pub fn to_matrix(&self, context: &str) -> Result<SparseMatrix, ConfigurationError> {
        for (what, len) in [("column indices", self.cols.len()), ("values", self.values.len())] {
            if len != self.rows.len() {
                return Err(ConfigurationError::DimensionMismatch {
                    context: format!("{what} of {context}"),
                    expected: self.rows.len(),
                    found: len,
                });
            }
        }
        let entries: Vec<(usize, usize, f64)> = self
            .rows
            .iter()
            .zip(&self.cols)
            .zip(&self.values)
            .map(|((&r, &c), &v)| (r, c, v))
            .collect();
        from_triplets(self.nrows, self.ncols, &entries).map_err(|source| ConfigurationError::Matrix {
            context: context.to_string(),
            source,
        })
    }
}

/// Dense matrix in row-major order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseSpec {
    pub nrows: usize,
    pub ncols: usize,
    pub values: Vec<f64>,
}

impl DenseSpec {
    pub fn to_array(&self, context: &str) -> Result<Array2<f64>, ConfigurationError> {
        Array2::from_shape_vec((self.nrows, self.ncols), self.values.clone()).map_err(|_| {
            ConfigurationError::DimensionMismatch {
                context: format!("entries of {context}"),
                expected: self.nrows * self.ncols,
                found: self.values.len(),
            }
        })
    }
}

fn default_alpha() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorSpec {
    Ar1 {
        g: SparseSpec,
        c: SparseSpec,
    },
    Matern {
        g: SparseSpec,
        c: SparseSpec,
        #[serde(default = "default_alpha")]
        alpha: u32,
    },
    MaternNonstationary {
        g: SparseSpec,
        c: SparseSpec,
        #[serde(default = "default_alpha")]
        alpha: u32,
        b_kappa: DenseSpec,
    },
}

impl OperatorSpec {
    fn build(&self, name: &str) -> Result<Operator, ConfigurationError> {
        let matrix = |spec: &SparseSpec, which: &str| spec.to_matrix(&format!("{which} of latent '{name}'"));
        match self {
            Self::Ar1 { g, c } => Operator::ar1(matrix(g, "G")?, matrix(c, "C")?),
            Self::Matern { g, c, alpha } => Operator::matern(matrix(g, "G")?, matrix(c, "C")?, *alpha),
            Self::MaternNonstationary { g, c, alpha, b_kappa } => Operator::nonstationary_matern(
                matrix(g, "G")?,
                matrix(c, "C")?,
                *alpha,
                b_kappa.to_array(&format!("B_kappa of latent '{name}'"))?,
            ),
        }
    }
}

/// Starting values; empty parameter vectors mean all zeros.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentStart {
    pub theta_k: Vec<f64>,
    pub theta_mu: Vec<f64>,
    pub theta_sigma: Vec<f64>,
    pub theta_nu: f64,
    pub w: Option<Vec<f64>>,
    pub v: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentControl {
    pub fix_operator: bool,
    pub fix_mu: bool,
    pub fix_sigma: bool,
    pub fix_nu: bool,
    pub numer_grad: bool,
    pub use_precond: bool,
    pub eps: f64,
    pub derivative: DerivativeMode,
    pub fix_w: bool,
    pub fix_v: bool,
}

impl Default for LatentControl {
    fn default() -> Self {
        Self {
            fix_operator: false,
            fix_mu: false,
            fix_sigma: false,
            fix_nu: false,
            numer_grad: false,
            use_precond: false,
            eps: 1e-3,
            derivative: DerivativeMode::Analytic,
            fix_w: false,
            fix_v: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentSpec {
    pub name: String,
    pub operator: OperatorSpec,
    #[serde(default)]
    pub mixing: MixingFamily,
    pub a: SparseSpec,
    /// Mesh weights; all ones when absent.
    #[serde(default)]
    pub h: Option<Vec<f64>>,
    /// Mean basis; a single intercept column when absent.
    #[serde(default)]
    pub b_mu: Option<DenseSpec>,
    #[serde(default)]
    pub b_sigma: Option<DenseSpec>,
    #[serde(default)]
    pub start: LatentStart,
    #[serde(default)]
    pub control: LatentControl,
}

fn start_vector(values: &[f64], len: usize) -> Array1<f64> {
    if values.is_empty() {
        Array1::zeros(len)
    } else {
        Array1::from(values.to_vec())
    }
}

impl LatentSpec {
    pub fn build(&self, rng: StdRng) -> Result<LatentProcess, ConfigurationError> {
        let name = self.name.as_str();
        let operator = self
            .operator
            .build(name)?
            .with_derivative(self.control.derivative, self.control.eps)?;
        let n = operator.n_mesh();

        let h = self.h.clone().map(Array1::from).unwrap_or_else(|| Array1::ones(n));
        if let Some(bad) = h.iter().position(|&x| !(x > 0.0 && x.is_finite())) {
            return Err(ConfigurationError::Invalid {
                context: format!("mesh weights h of latent '{name}'"),
                reason: format!("entry {bad} is {}, a positive weight is required", h[bad]),
            });
        }
        let mixing = match self.mixing {
            MixingFamily::Normal => Mixing::normal(h),
            MixingFamily::Nig => Mixing::nig(h, self.start.theta_nu),
        };
        let basis = |spec: &Option<DenseSpec>, which: &str| match spec {
            Some(dense) => dense.to_array(&format!("{which} of latent '{name}'")),
            None => Ok(Array2::ones((n, 1))),
        };
        let b_mu = basis(&self.b_mu, "B_mu")?;
        let b_sigma = basis(&self.b_sigma, "B_sigma")?;

        let setup = ProcessSetup {
            name: self.name.clone(),
            theta_k: start_vector(&self.start.theta_k, operator.n_params()),
            theta_mu: start_vector(&self.start.theta_mu, b_mu.ncols()),
            theta_sigma: start_vector(&self.start.theta_sigma, b_sigma.ncols()),
            operator,
            mixing,
            a: self.a.to_matrix(&format!("observation matrix A of latent '{name}'"))?,
            b_mu,
            b_sigma,
            w: self.start.w.clone().map(Array1::from),
            v: self.start.v.clone().map(Array1::from),
            fixed: [
                self.control.fix_operator,
                self.control.fix_mu,
                self.control.fix_sigma,
                self.control.fix_nu,
            ],
            fix_w: self.control.fix_w,
            numer_grad: self.control.numer_grad,
            use_precond: self.control.use_precond,
            rng,
        };
        let mut process = LatentProcess::new(setup)?;
        if self.control.fix_v {
            process.mixing_mut().fix_v();
        }
        Ok(process)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSpec {
    pub family: MixingFamily,
    pub theta_sigma: f64,
    pub mu: f64,
    pub theta_nu: f64,
    pub fix: bool,
}

impl Default for NoiseSpec {
    fn default() -> Self {
        Self {
            family: MixingFamily::Normal,
            theta_sigma: 0.0,
            mu: 0.0,
            theta_nu: 0.0,
            fix: false,
        }
    }
}

/// Sampler and step-controller settings of a [`BlockModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelControl {
    /// Gibbs sweeps averaged per gradient.
    pub n_gibbs: usize,
    /// Sweeps discarded at construction.
    pub burn_in: usize,
    pub examine_gradient: bool,
    pub kill_power: f64,
    pub threshold: f64,
    pub term_eps: f64,
    pub term_window: usize,
    pub fix_beta: bool,
}

impl Default for ModelControl {
    fn default() -> Self {
        Self {
            n_gibbs: 20,
            burn_in: 5,
            examine_gradient: false,
            kill_power: 0.75,
            threshold: 1e-4,
            term_eps: 1e-6,
            term_window: 10,
            fix_beta: false,
        }
    }
}

impl ModelControl {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |context: &str, reason: String| ConfigurationError::Invalid {
            context: format!("control.{context}"),
            reason,
        };
        if self.n_gibbs == 0 {
            return Err(invalid("n_gibbs", "at least one Gibbs sweep per gradient is required".to_string()));
        }
        if self.examine_gradient {
            if self.term_window == 0 {
                return Err(invalid("term_window", "must be at least 1".to_string()));
            }
            if !(self.kill_power >= 0.0 && self.kill_power.is_finite()) {
                return Err(invalid("kill_power", format!("must be non-negative, found {}", self.kill_power)));
            }
        }
        Ok(())
    }

    pub fn schedule(&self) -> ScheduleSettings {
        ScheduleSettings {
            kill_power: self.kill_power,
            threshold: self.threshold,
            term_eps: self.term_eps,
            term_window: self.term_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub seed: u64,
    pub y: Vec<f64>,
    #[serde(default)]
    pub x: Option<DenseSpec>,
    #[serde(default)]
    pub beta: Option<Vec<f64>>,
    #[serde(default)]
    pub noise: NoiseSpec,
    pub latents: Vec<LatentSpec>,
    #[serde(default)]
    pub control: ModelControl,
}

impl ModelSpec {
    pub fn build(&self) -> Result<BlockModel, FitError> {
        let n_obs = self.y.len();
        let x = match &self.x {
            Some(dense) => dense.to_array("fixed-effect design X")?,
            None => Array2::zeros((n_obs, 0)),
        };
        let beta = match &self.beta {
            Some(beta) => Array1::from(beta.clone()),
            None => Array1::zeros(x.ncols()),
        };
        let processes = self
            .latents
            .iter()
            .enumerate()
            .map(|(index, latent)| latent.build(stream(self.seed, index as u64 + 1)))
            .collect::<Result<Vec<_>, _>>()?;
        let noise_stream = stream(self.seed, self.latents.len() as u64 + 1);
        let mut noise = MeasurementNoise::new(
            self.noise.family,
            n_obs,
            self.noise.mu,
            self.noise.theta_sigma,
            self.noise.theta_nu,
            noise_stream,
        );
        if self.noise.fix {
            noise.fix();
        }
        BlockModel::new(BlockSetup {
            y: Array1::from(self.y.clone()),
            x,
            beta,
            processes,
            noise,
            control: self.control.clone(),
            seed: self.seed,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub step_size: f64,
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    pub preconditioned: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            step_size: 1.0,
            max_iterations: 100,
            gradient_tolerance: 1e-6,
            preconditioned: false,
        }
    }
}

impl OptimizerSettings {
    pub fn optimizer(&self) -> Optimizer {
        Optimizer {
            iterations: self.max_iterations,
            step_size: self.step_size,
            gradient_tolerance: self.gradient_tolerance,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    pub model: ModelSpec,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
}

impl FitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
