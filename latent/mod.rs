pub mod mixing;
pub mod operator;
pub mod process;

pub use mixing::{Mixing, MixingFamily};
pub use operator::{DerivativeMode, MaternExponent, Operator, ar1_to_constrained, ar1_to_unconstrained};
pub use process::{LatentEstimate, LatentProcess, ParameterBlock, ProcessSetup};
