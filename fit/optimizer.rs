// fit/optimizer.rs

//! Stochastic-gradient drivers for any model that can report a noisy
//! descent direction.
//!
//! A model's `gradient()` already returns the (Newton-scaled where available)
//! direction `g` such that `θ ← θ - step ⊙ g` improves the likelihood; the
//! optimizer only owns the iteration budget, step sizes, stopping rule and
//! trajectory.

use crate::errors::FitError;
use crate::linalg::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::progress::{FitProgressObserver, FitProgressStage, NoopFitProgress};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use thiserror::Error;

/// A model driven by [`Optimizer`].
pub trait StochasticModel {
    fn parameter(&self) -> Array1<f64>;

    /// Next (possibly stochastic) descent direction at the current parameter.
    fn gradient(&mut self) -> Result<Array1<f64>, FitError>;

    fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) -> Result<(), FitError>;

    /// Per-parameter step multipliers chosen by the model, if it keeps any.
    fn step_sizes(&self) -> Option<Array1<f64>> {
        None
    }

    /// Symmetric positive-definite preconditioner for the current gradient.
    fn precond(&self) -> Option<Array2<f64>> {
        None
    }
}

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error(transparent)]
    Fit(#[from] FitError),

    #[error("The preconditioned optimizer requires the model to supply a preconditioner.")]
    PreconditionerUnavailable,

    #[error("Preconditioner at iteration {iteration} is not positive definite: {source}")]
    PreconditionerFactorization {
        iteration: usize,
        #[source]
        source: FaerLinalgError,
    },

    #[error("Non-finite gradient at iteration {iteration}.")]
    NonFiniteGradient { iteration: usize },

    #[error("{context}: expected length {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub parameter: Vec<f64>,
    pub gradient: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceStatus {
    pub converged: bool,
    pub iterations: usize,
    pub final_gradient_norm: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationOutcome {
    pub parameter: Vec<f64>,
    pub trajectory: Vec<IterationRecord>,
    pub status: ConvergenceStatus,
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    pub iterations: usize,
    pub step_size: f64,
    pub gradient_tolerance: f64,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            iterations: 100,
            step_size: 1.0,
            gradient_tolerance: 1e-6,
        }
    }
}

enum Direction {
    Plain,
    Preconditioned,
}

impl Optimizer {
    pub fn new(iterations: usize, step_size: f64) -> Self {
        Self {
            iterations,
            step_size,
            ..Self::default()
        }
    }

    pub fn run<M: StochasticModel>(&self, model: &mut M) -> Result<OptimizationOutcome, OptimizerError> {
        self.drive(model, &mut NoopFitProgress, Direction::Plain)
    }

    pub fn run_with_observer<M: StochasticModel>(
        &self,
        model: &mut M,
        observer: &mut dyn FitProgressObserver,
    ) -> Result<OptimizationOutcome, OptimizerError> {
        self.drive(model, observer, Direction::Plain)
    }

    /// Like [`Optimizer::run`] but solves `P d = g` with the model's
    /// preconditioner every iteration and steps along `d`.
    pub fn run_preconditioned<M: StochasticModel>(
        &self,
        model: &mut M,
        observer: &mut dyn FitProgressObserver,
    ) -> Result<OptimizationOutcome, OptimizerError> {
        self.drive(model, observer, Direction::Preconditioned)
    }

    fn drive<M: StochasticModel>(
        &self,
        model: &mut M,
        observer: &mut dyn FitProgressObserver,
        direction: Direction,
    ) -> Result<OptimizationOutcome, OptimizerError> {
        let mut theta = model.parameter();
        let n = theta.len();
        let mut trajectory = Vec::with_capacity(self.iterations);
        let mut status = ConvergenceStatus {
            converged: false,
            iterations: 0,
            final_gradient_norm: f64::INFINITY,
        };

        observer.on_stage_start(FitProgressStage::Optimization, self.iterations);
        for iteration in 1..=self.iterations {
            let gradient = model.gradient()?;
            if gradient.len() != n {
                return Err(OptimizerError::DimensionMismatch {
                    context: "model gradient",
                    expected: n,
                    found: gradient.len(),
                });
            }
            if gradient.iter().any(|g| !g.is_finite()) {
                return Err(OptimizerError::NonFiniteGradient { iteration });
            }
            let norm = gradient.dot(&gradient).sqrt();

            let step_direction = match direction {
                Direction::Plain => gradient.clone(),
                Direction::Preconditioned => {
                    let precond = model.precond().ok_or(OptimizerError::PreconditionerUnavailable)?;
                    if precond.nrows() != n || precond.ncols() != n {
                        return Err(OptimizerError::DimensionMismatch {
                            context: "preconditioner",
                            expected: n,
                            found: precond.nrows(),
                        });
                    }
                    let factor = precond
                        .cholesky(Side::Lower)
                        .map_err(|source| OptimizerError::PreconditionerFactorization { iteration, source })?;
                    factor.solve_vec(&gradient)
                }
            };

            let mut step = Array1::from_elem(n, self.step_size);
            if let Some(multipliers) = model.step_sizes() {
                if multipliers.len() != n {
                    return Err(OptimizerError::DimensionMismatch {
                        context: "model step sizes",
                        expected: n,
                        found: multipliers.len(),
                    });
                }
                step *= &multipliers;
            }
            theta = &theta - &(&step * &step_direction);
            model.set_parameter(theta.view())?;
            // The model may keep frozen blocks at their old values.
            theta = model.parameter();

            trajectory.push(IterationRecord {
                iteration,
                parameter: theta.to_vec(),
                gradient: gradient.to_vec(),
            });
            observer.on_iteration(iteration, norm);
            log::debug!("Iteration {iteration}: |g| = {norm:.3e}");

            status.iterations = iteration;
            status.final_gradient_norm = norm;
            if norm <= self.gradient_tolerance {
                status.converged = true;
                log::info!("Gradient norm {norm:.3e} within tolerance after {iteration} iterations.");
                break;
            }
        }
        observer.on_stage_finish(FitProgressStage::Optimization);

        if !status.converged {
            log::warn!(
                "Iteration budget of {} exhausted; final gradient norm {:.3e}.",
                self.iterations,
                status.final_gradient_norm
            );
        }
        Ok(OptimizationOutcome {
            parameter: theta.to_vec(),
            trajectory,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// `f(θ) = ½ (θ - c)ᵀ H (θ - c)` with an exact or Newton-scaled gradient.
    struct Quadratic {
        theta: Array1<f64>,
        centre: Array1<f64>,
        hessian: Array2<f64>,
        newton: bool,
        with_precond: bool,
    }

    impl Quadratic {
        fn new(newton: bool, with_precond: bool) -> Self {
            Self {
                theta: Array1::from(vec![3.0, -2.0]),
                centre: Array1::from(vec![1.0, 0.5]),
                hessian: Array2::from_shape_vec((2, 2), vec![2.0, 0.5, 0.5, 1.0]).unwrap(),
                newton,
                with_precond,
            }
        }
    }

    impl StochasticModel for Quadratic {
        fn parameter(&self) -> Array1<f64> {
            self.theta.clone()
        }

        fn gradient(&mut self) -> Result<Array1<f64>, FitError> {
            let g = self.hessian.dot(&(&self.theta - &self.centre));
            if self.newton {
                let factor = self.hessian.cholesky(Side::Lower).unwrap();
                Ok(factor.solve_vec(&g))
            } else {
                Ok(g)
            }
        }

        fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) -> Result<(), FitError> {
            self.theta.assign(&theta);
            Ok(())
        }

        fn precond(&self) -> Option<Array2<f64>> {
            self.with_precond.then(|| self.hessian.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        iterations: Vec<usize>,
        norms: Vec<f64>,
        finished: bool,
    }

    impl FitProgressObserver for Recorder {
        fn on_iteration(&mut self, iteration: usize, gradient_norm: f64) {
            self.iterations.push(iteration);
            self.norms.push(gradient_norm);
        }
        fn on_stage_finish(&mut self, stage: FitProgressStage) {
            self.finished = stage == FitProgressStage::Optimization;
        }
    }

    /// Constant gradient with optional per-parameter step multipliers.
    struct Flat {
        theta: Array1<f64>,
        gradient: Array1<f64>,
        steps: Option<Array1<f64>>,
    }

    impl StochasticModel for Flat {
        fn parameter(&self) -> Array1<f64> {
            self.theta.clone()
        }

        fn gradient(&mut self) -> Result<Array1<f64>, FitError> {
            Ok(self.gradient.clone())
        }

        fn set_parameter(&mut self, theta: ArrayView1<'_, f64>) -> Result<(), FitError> {
            self.theta.assign(&theta);
            Ok(())
        }

        fn step_sizes(&self) -> Option<Array1<f64>> {
            self.steps.clone()
        }
    }

    #[test]
    fn newton_scaled_gradient_converges_in_one_step() {
        let mut model = Quadratic::new(true, false);
        let outcome = Optimizer::new(10, 1.0).run(&mut model).unwrap();
        assert!(outcome.status.converged);
        assert_eq!(outcome.status.iterations, 2);
        assert_abs_diff_eq!(outcome.parameter[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(outcome.parameter[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn small_steps_record_the_full_trajectory() {
        let mut model = Quadratic::new(false, false);
        let mut recorder = Recorder::default();
        let outcome = Optimizer::new(200, 0.2).run_with_observer(&mut model, &mut recorder).unwrap();
        assert_eq!(outcome.trajectory.len(), outcome.status.iterations);
        assert_eq!(recorder.iterations.len(), outcome.status.iterations);
        assert!(recorder.finished);
        assert!(recorder.norms.windows(2).all(|w| w[1] <= w[0]));
        assert_abs_diff_eq!(outcome.parameter[0], 1.0, epsilon = 1e-4);
        assert!(outcome.status.final_gradient_norm < 1e-6);
    }

    #[test]
    fn preconditioner_turns_plain_gradient_into_newton_step() {
        let mut model = Quadratic::new(false, true);
        let outcome = Optimizer::new(5, 1.0)
            .run_preconditioned(&mut model, &mut NoopFitProgress)
            .unwrap();
        assert!(outcome.status.converged);
        assert_abs_diff_eq!(outcome.parameter[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn missing_preconditioner_is_an_error() {
        let mut model = Quadratic::new(false, false);
        let result = Optimizer::new(5, 1.0).run_preconditioned(&mut model, &mut NoopFitProgress);
        assert!(matches!(result, Err(OptimizerError::PreconditionerUnavailable)));
    }

    #[test]
    fn exhausted_budget_is_not_converged() {
        let mut model = Quadratic::new(false, false);
        let outcome = Optimizer::new(3, 0.01).run(&mut model).unwrap();
        assert!(!outcome.status.converged);
        assert_eq!(outcome.status.iterations, 3);
    }

    #[test]
    fn gradient_norm_equal_to_tolerance_counts_as_converged() {
        let mut model = Flat {
            theta: Array1::zeros(2),
            gradient: Array1::from(vec![0.5, 0.0]),
            steps: None,
        };
        let optimizer = Optimizer {
            iterations: 10,
            step_size: 1.0,
            gradient_tolerance: 0.5,
        };
        let outcome = optimizer.run(&mut model).unwrap();
        assert!(outcome.status.converged);
        assert_eq!(outcome.status.iterations, 1);
        assert_eq!(outcome.status.final_gradient_norm, 0.5);
    }

    #[test]
    fn step_multipliers_scale_each_coordinate() {
        let mut model = Flat {
            theta: Array1::zeros(2),
            gradient: Array1::from(vec![1.0, 1.0]),
            steps: Some(Array1::from(vec![1.0, 0.25])),
        };
        let outcome = Optimizer::new(2, 0.5).run(&mut model).unwrap();
        assert_abs_diff_eq!(outcome.parameter[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(outcome.parameter[1], -0.25, epsilon = 1e-12);
    }

    #[test]
    fn step_multipliers_of_the_wrong_length_are_rejected() {
        let mut model = Flat {
            theta: Array1::zeros(2),
            gradient: Array1::from(vec![1.0, 1.0]),
            steps: Some(Array1::from(vec![1.0, 0.5, 0.25])),
        };
        let result = Optimizer::new(3, 1.0).run(&mut model);
        assert!(matches!(
            result,
            Err(OptimizerError::DimensionMismatch {
                context: "model step sizes",
                expected: 2,
                found: 3,
            })
        ));
    }
}
