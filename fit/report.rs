// fit/report.rs

//! The result of a fit: final estimates in their natural scale, the optimizer
//! trajectory and its convergence status.

use crate::block::BlockModel;
use crate::config::{ConfigError, FitConfig};
use crate::latent::{LatentEstimate, MixingFamily};
use crate::optimizer::{ConvergenceStatus, IterationRecord, OptimizationOutcome, OptimizerError};
use crate::progress::FitProgressObserver;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct NoiseEstimate {
    pub family: MixingFamily,
    pub sigma: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nu: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub status: ConvergenceStatus,
    pub parameter_names: Vec<String>,
    pub parameters: Vec<f64>,
    pub beta: Vec<f64>,
    pub noise: NoiseEstimate,
    pub latents: Vec<LatentEstimate>,
    pub trajectory: Vec<IterationRecord>,
}

impl FitReport {
    pub fn new(model: &BlockModel, outcome: OptimizationOutcome) -> Self {
        let noise = model.noise();
        let nig = noise.family() == MixingFamily::Nig;
        Self {
            status: outcome.status,
            parameter_names: model.parameter_names(),
            parameters: outcome.parameter,
            beta: model.beta().to_vec(),
            noise: NoiseEstimate {
                family: noise.family(),
                sigma: noise.sigma(),
                mu: nig.then(|| noise.mu()),
                nu: nig.then(|| noise.mixing().nu()),
            },
            latents: model.estimates(),
            trajectory: outcome.trajectory,
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes the report as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Builds the model described by `config`, runs the configured optimizer and
/// collects the report.
pub fn fit(config: &FitConfig, observer: &mut dyn FitProgressObserver) -> Result<FitReport, OptimizerError> {
    let mut model = config.model.build()?;
    let optimizer = config.optimizer.optimizer();
    log::info!(
        "Starting {} optimization: {} iterations, step size {}.",
        if config.optimizer.preconditioned { "preconditioned" } else { "stochastic-gradient" },
        optimizer.iterations,
        optimizer.step_size
    );
    let outcome = if config.optimizer.preconditioned {
        optimizer.run_preconditioned(&mut model, observer)?
    } else {
        optimizer.run_with_observer(&mut model, observer)?
    };
    log::info!(
        "Optimization finished after {} iterations (final gradient norm {:.3e}).",
        outcome.status.iterations,
        outcome.status.final_gradient_norm
    );
    Ok(FitReport::new(&model, outcome))
}
