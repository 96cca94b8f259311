// fit/errors.rs

//! Error taxonomy shared by model construction, the Gibbs sampler, and the
//! optimizer. Construction problems are [`ConfigurationError`]s; failures inside
//! a run are [`NumericalFailure`]s, which the block model wraps together with the
//! joint parameter vector in force when they happened.

use crate::linalg::LinalgError;
use crate::random::GigError;
use ndarray::Array1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{context} must be square, found {nrows}x{ncols}")]
    NotSquare {
        context: String,
        nrows: usize,
        ncols: usize,
    },

    #[error("{context}: expected dimension {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("Unsupported Matérn exponent {0}; only 2 and 4 are available")]
    UnsupportedExponent(u32),

    #[error("{context}: expected {expected} parameters, found {found}")]
    ParameterCount {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("{context}: {reason}")]
    Invalid { context: String, reason: String },

    #[error("Could not assemble {context}: {source}")]
    Matrix {
        context: String,
        #[source]
        source: LinalgError,
    },
}

#[derive(Debug, Error)]
pub enum NumericalFailure {
    #[error("Factorization of {matrix} failed: {source}")]
    Factorization {
        matrix: String,
        #[source]
        source: LinalgError,
    },

    #[error("GIG sampling failed while updating {context}: {source}")]
    Gig {
        context: String,
        #[source]
        source: GigError,
    },
}

impl NumericalFailure {
    pub fn factorization(matrix: impl Into<String>, source: LinalgError) -> Self {
        NumericalFailure::Factorization {
            matrix: matrix.into(),
            source,
        }
    }

    pub fn gig(context: impl Into<String>, source: GigError) -> Self {
        NumericalFailure::Gig {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Invalid model configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Numerical failure: {failure} (parameters at failure: {parameters})")]
    Numerical {
        #[source]
        failure: NumericalFailure,
        parameters: Array1<f64>,
    },
}
