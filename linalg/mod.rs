pub mod faer_ndarray;
pub mod sparse;

pub use sparse::{CholeskyFactor, LinalgError, LuFactor, SparseCholesky, SparseMatrix};
