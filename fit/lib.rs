#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

#[path = "../linalg/mod.rs"]
pub mod linalg;

#[path = "../random/mod.rs"]
pub mod random;

#[path = "../latent/mod.rs"]
pub mod latent;

pub mod block;
pub mod config;
pub mod errors;
pub mod noise;
pub mod optimizer;
pub mod progress;
pub mod report;
pub mod schedule;

pub use block::{BlockModel, BlockSetup};
pub use config::{FitConfig, ModelControl};
pub use errors::{ConfigurationError, FitError, NumericalFailure};
pub use optimizer::{Optimizer, OptimizerError, StochasticModel};
pub use report::{FitReport, fit};
