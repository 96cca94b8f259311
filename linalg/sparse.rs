//! Compressed-sparse-column helpers built on `faer::sparse`.
//!
//! The operator, observation and precision matrices of the model are all stored
//! as `SparseColMat<usize, f64>`. Products and sums are assembled column by
//! column directly on the CSC arrays so that the sparsity pattern of a result
//! depends only on the patterns of its inputs, never on their values. This keeps
//! the joint precision pattern fixed across Gibbs sweeps, which is what lets
//! [`SparseCholesky`] reuse one symbolic analysis for the whole run.

use crate::linalg::faer_ndarray::{FaerColView, FaerLinalgError};
use faer::dyn_stack::{MemBuffer, MemStack};
use faer::linalg::solvers::Solve;
use faer::perm::PermRef;
use faer::sparse::linalg::lu::simplicial::{
    SimplicialLu, factorize_simplicial_numeric_lu, factorize_simplicial_numeric_lu_scratch,
};
use faer::sparse::linalg::lu::{LuSymbolicParams, SymbolicLu, factorize_symbolic_lu};
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Conj, Mat, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;

pub type SparseMatrix = SparseColMat<usize, f64>;

/// Columns solved per batch when forming `trace(K^{-1} M)`.
const TRACE_BATCH_COLUMNS: usize = 64;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Failed to assemble a {nrows}x{ncols} sparse matrix from triplets")]
    InvalidTriplets { nrows: usize, ncols: usize },

    #[error("Dimension mismatch in {operation}: left is {left:?}, right is {right:?}")]
    DimensionMismatch {
        operation: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Matrix is singular or its LU factorization produced non-finite values")]
    Singular,

    #[error("Symbolic Cholesky analysis failed")]
    SymbolicAnalysis,

    #[error("Dense factorization failed: {0}")]
    Dense(#[from] FaerLinalgError),
}

/// Builds a CSC matrix from `(row, col, value)` entries; duplicates are summed.
pub fn from_triplets(
    nrows: usize,
    ncols: usize,
    entries: &[(usize, usize, f64)],
) -> Result<SparseMatrix, LinalgError> {
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .iter()
        .map(|&(row, col, value)| Triplet::new(row, col, value))
        .collect();
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
        .map_err(|_| LinalgError::InvalidTriplets { nrows, ncols })
}

/// All stored entries in column-major order, explicit zeros included.
pub fn triplets(matrix: &SparseMatrix) -> Vec<(usize, usize, f64)> {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let mut out = Vec::with_capacity(values.len());
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            out.push((row_idx[idx], col, values[idx]));
        }
    }
    out
}

pub fn identity(n: usize) -> Result<SparseMatrix, LinalgError> {
    let entries: Vec<_> = (0..n).map(|i| (i, i, 1.0)).collect();
    from_triplets(n, n, &entries)
}

pub fn diagonal(values: ArrayView1<'_, f64>) -> Result<SparseMatrix, LinalgError> {
    let n = values.len();
    let entries: Vec<_> = values.iter().enumerate().map(|(i, &v)| (i, i, v)).collect();
    from_triplets(n, n, &entries)
}

/// The main diagonal, with zeros where no entry is stored.
pub fn diagonal_of(matrix: &SparseMatrix) -> Array1<f64> {
    let mut out = Array1::zeros(matrix.nrows().min(matrix.ncols()));
    for (row, col, value) in triplets(matrix) {
        if row == col {
            out[row] += value;
        }
    }
    out
}

pub fn matvec(matrix: &SparseMatrix, vector: ArrayView1<'_, f64>) -> Array1<f64> {
    let mut output = Array1::<f64>::zeros(matrix.nrows());
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        let x = vector[col];
        if x == 0.0 {
            continue;
        }
        for idx in col_ptr[col]..col_ptr[col + 1] {
            output[row_idx[idx]] += values[idx] * x;
        }
    }
    output
}

pub fn transpose_matvec(matrix: &SparseMatrix, vector: ArrayView1<'_, f64>) -> Array1<f64> {
    let mut output = Array1::<f64>::zeros(matrix.ncols());
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        let mut acc = 0.0;
        for idx in col_ptr[col]..col_ptr[col + 1] {
            acc += values[idx] * vector[row_idx[idx]];
        }
        output[col] = acc;
    }
    output
}

pub fn transpose(matrix: &SparseMatrix) -> Result<SparseMatrix, LinalgError> {
    let entries: Vec<_> = triplets(matrix)
        .into_iter()
        .map(|(row, col, value)| (col, row, value))
        .collect();
    from_triplets(matrix.ncols(), matrix.nrows(), &entries)
}

/// `Σ_k c_k M_k` over matrices of identical shape; the result carries the union
/// of the input patterns.
pub fn linear_combination(terms: &[(f64, &SparseMatrix)]) -> Result<SparseMatrix, LinalgError> {
    let Some((_, first)) = terms.first() else {
        return from_triplets(0, 0, &[]);
    };
    let shape = (first.nrows(), first.ncols());
    let mut entries = Vec::new();
    for &(coef, matrix) in terms {
        if (matrix.nrows(), matrix.ncols()) != shape {
            return Err(LinalgError::DimensionMismatch {
                operation: "linear combination",
                left: shape,
                right: (matrix.nrows(), matrix.ncols()),
            });
        }
        entries.extend(
            triplets(matrix)
                .into_iter()
                .map(|(row, col, value)| (row, col, coef * value)),
        );
    }
    from_triplets(shape.0, shape.1, &entries)
}

/// `diag(d) · M`.
pub fn scale_rows(
    matrix: &SparseMatrix,
    d: ArrayView1<'_, f64>,
) -> Result<SparseMatrix, LinalgError> {
    if d.len() != matrix.nrows() {
        return Err(LinalgError::DimensionMismatch {
            operation: "row scaling",
            left: (d.len(), d.len()),
            right: (matrix.nrows(), matrix.ncols()),
        });
    }
    let entries: Vec<_> = triplets(matrix)
        .into_iter()
        .map(|(row, col, value)| (row, col, d[row] * value))
        .collect();
    from_triplets(matrix.nrows(), matrix.ncols(), &entries)
}

/// Sparse-sparse product `A · B` (Gustavson, one dense accumulator per column).
pub fn product(a: &SparseMatrix, b: &SparseMatrix) -> Result<SparseMatrix, LinalgError> {
    if a.ncols() != b.nrows() {
        return Err(LinalgError::DimensionMismatch {
            operation: "product",
            left: (a.nrows(), a.ncols()),
            right: (b.nrows(), b.ncols()),
        });
    }
    let (a_symbolic, a_values) = a.parts();
    let a_col_ptr = a_symbolic.col_ptr();
    let a_row_idx = a_symbolic.row_idx();
    let (b_symbolic, b_values) = b.parts();
    let b_col_ptr = b_symbolic.col_ptr();
    let b_row_idx = b_symbolic.row_idx();

    let mut accumulator = vec![0.0_f64; a.nrows()];
    let mut marker = vec![usize::MAX; a.nrows()];
    let mut touched = Vec::new();
    let mut entries = Vec::new();

    for col in 0..b.ncols() {
        touched.clear();
        for b_idx in b_col_ptr[col]..b_col_ptr[col + 1] {
            let k = b_row_idx[b_idx];
            let b_kj = b_values[b_idx];
            for a_idx in a_col_ptr[k]..a_col_ptr[k + 1] {
                let row = a_row_idx[a_idx];
                if marker[row] != col {
                    marker[row] = col;
                    accumulator[row] = 0.0;
                    touched.push(row);
                }
                accumulator[row] += a_values[a_idx] * b_kj;
            }
        }
        touched.sort_unstable();
        entries.extend(touched.iter().map(|&row| (row, col, accumulator[row])));
    }
    from_triplets(a.nrows(), b.ncols(), &entries)
}

/// `Aᵀ · diag(w) · A`.
pub fn weighted_gram(
    a: &SparseMatrix,
    weights: ArrayView1<'_, f64>,
) -> Result<SparseMatrix, LinalgError> {
    let scaled = scale_rows(a, weights)?;
    product(&transpose(a)?, &scaled)
}

/// Places square or rectangular blocks along the diagonal.
pub fn block_diagonal(blocks: &[&SparseMatrix]) -> Result<SparseMatrix, LinalgError> {
    let nrows = blocks.iter().map(|b| b.nrows()).sum();
    let ncols = blocks.iter().map(|b| b.ncols()).sum();
    let mut entries = Vec::new();
    let (mut row_offset, mut col_offset) = (0, 0);
    for block in blocks {
        entries.extend(
            triplets(block)
                .into_iter()
                .map(|(row, col, value)| (row + row_offset, col + col_offset, value)),
        );
        row_offset += block.nrows();
        col_offset += block.ncols();
    }
    from_triplets(nrows, ncols, &entries)
}

/// Horizontal concatenation `[B_1 B_2 ... B_m]` of blocks sharing a row count.
pub fn hstack(blocks: &[&SparseMatrix]) -> Result<SparseMatrix, LinalgError> {
    let nrows = blocks.first().map_or(0, |b| b.nrows());
    let mut entries = Vec::new();
    let mut col_offset = 0;
    for block in blocks {
        if block.nrows() != nrows {
            return Err(LinalgError::DimensionMismatch {
                operation: "horizontal stacking",
                left: (nrows, col_offset),
                right: (block.nrows(), block.ncols()),
            });
        }
        entries.extend(
            triplets(block)
                .into_iter()
                .map(|(row, col, value)| (row, col + col_offset, value)),
        );
        col_offset += block.ncols();
    }
    from_triplets(nrows, col_offset, &entries)
}

pub fn to_dense(matrix: &SparseMatrix) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
    for (row, col, value) in triplets(matrix) {
        dense[[row, col]] += value;
    }
    dense
}

fn same_pattern(matrix: &SparseMatrix, col_ptr: &[usize], row_idx: &[usize]) -> bool {
    let symbolic = matrix.symbolic();
    symbolic.col_ptr() == col_ptr && symbolic.row_idx() == row_idx
}

fn solve_column<F: Solve<f64>>(factor: &F, rhs: ArrayView1<'_, f64>) -> Array1<f64> {
    let rhs_view = FaerColView::new(&rhs);
    let out = factor.solve(rhs_view.as_ref());
    Array1::from_shape_fn(rhs.len(), |i| out[(i, 0)])
}

struct AnalyzedPattern {
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    symbolic: SymbolicLlt<usize>,
}

/// Sparse Cholesky solver whose symbolic analysis is computed once per
/// sparsity pattern and reused for every numeric factorization.
pub struct SparseCholesky {
    label: String,
    analyzed: Option<AnalyzedPattern>,
    analyses: usize,
}

impl SparseCholesky {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            analyzed: None,
            analyses: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of symbolic analyses performed so far.
    pub fn analyses(&self) -> usize {
        self.analyses
    }

    pub fn analyze(&mut self, q: &SparseMatrix) -> Result<(), LinalgError> {
        let symbolic = SymbolicLlt::try_new(q.symbolic(), Side::Lower)
            .map_err(|_| LinalgError::SymbolicAnalysis)?;
        let pattern = q.symbolic();
        self.analyzed = Some(AnalyzedPattern {
            col_ptr: pattern.col_ptr().to_vec(),
            row_idx: pattern.row_idx().to_vec(),
            symbolic,
        });
        self.analyses += 1;
        Ok(())
    }

    pub fn factorize(&mut self, q: &SparseMatrix) -> Result<CholeskyFactor, LinalgError> {
        if q.nrows() != q.ncols() {
            return Err(LinalgError::DimensionMismatch {
                operation: "Cholesky factorization",
                left: (q.nrows(), q.ncols()),
                right: (q.ncols(), q.nrows()),
            });
        }
        let reusable = self
            .analyzed
            .as_ref()
            .is_some_and(|a| same_pattern(q, &a.col_ptr, &a.row_idx));
        if !reusable {
            if self.analyzed.is_some() {
                log::debug!("Sparsity pattern of {} changed; repeating symbolic analysis", self.label);
            }
            self.analyze(q)?;
        }
        let symbolic = match &self.analyzed {
            Some(analyzed) => analyzed.symbolic.clone(),
            None => return Err(LinalgError::SymbolicAnalysis),
        };
        let llt = Llt::try_new_with_symbolic(symbolic, q.as_ref(), Side::Lower)
            .map_err(|_| LinalgError::NotPositiveDefinite)?;
        Ok(CholeskyFactor { llt })
    }
}

pub struct CholeskyFactor {
    llt: Llt<usize, f64>,
}

impl CholeskyFactor {
    pub fn solve(&self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, LinalgError> {
        let solution = solve_column(&self.llt, rhs);
        if solution.iter().all(|v| v.is_finite()) {
            Ok(solution)
        } else {
            Err(LinalgError::NotPositiveDefinite)
        }
    }
}

/// Sparse LU `P K Q = L U` of a square, generally non-symmetric operator.
///
/// The column ordering comes from a COLAMD symbolic pass and the numeric factor is
/// the simplicial left-looking kind, so `U` is available for determinants.
pub struct LuFactor {
    symbolic: SymbolicLu<usize>,
    lu: SimplicialLu<usize, f64>,
    row_perm_fwd: Vec<usize>,
    row_perm_inv: Vec<usize>,
    n: usize,
}

impl LuFactor {
    pub fn new(k: &SparseMatrix) -> Result<Self, LinalgError> {
        if k.nrows() != k.ncols() {
            return Err(LinalgError::DimensionMismatch {
                operation: "LU factorization",
                left: (k.nrows(), k.ncols()),
                right: (k.ncols(), k.nrows()),
            });
        }
        let n = k.nrows();
        let symbolic =
            factorize_symbolic_lu(k.symbolic(), LuSymbolicParams::default()).map_err(|_| LinalgError::SymbolicAnalysis)?;
        let mut lu = SimplicialLu::new();
        let mut row_perm_fwd = vec![0usize; n];
        let mut row_perm_inv = vec![0usize; n];
        let mut buffer = MemBuffer::new(factorize_simplicial_numeric_lu_scratch::<usize, f64>(n, n));
        factorize_simplicial_numeric_lu(
            &mut row_perm_fwd,
            &mut row_perm_inv,
            &mut lu,
            k.as_ref(),
            symbolic.col_perm(),
            MemStack::new(&mut buffer),
        )
        .map_err(|_| LinalgError::Singular)?;
        Ok(Self {
            symbolic,
            lu,
            row_perm_fwd,
            row_perm_inv,
            n,
        })
    }

    fn solve_in_place(&self, rhs: &mut Mat<f64>) {
        let mut work = Mat::<f64>::zeros(rhs.nrows(), rhs.ncols());
        let row_perm = PermRef::new_checked(&self.row_perm_fwd, &self.row_perm_inv, self.n);
        self.lu.solve_in_place_with_conj(
            row_perm,
            self.symbolic.col_perm(),
            Conj::No,
            rhs.as_mut(),
            get_global_parallelism(),
            work.as_mut(),
        );
    }

    pub fn solve(&self, rhs: ArrayView1<'_, f64>) -> Result<Array1<f64>, LinalgError> {
        let mut x = Mat::<f64>::from_fn(self.n, 1, |i, _| rhs[i]);
        self.solve_in_place(&mut x);
        let solution = Array1::from_shape_fn(self.n, |i| x[(i, 0)]);
        if solution.iter().all(|v| v.is_finite()) {
            Ok(solution)
        } else {
            Err(LinalgError::Singular)
        }
    }

    /// `log|det K| = Σ log|U_ii|`; the permutations only flip the sign.
    pub fn log_abs_det(&self) -> Result<f64, LinalgError> {
        let u = self.lu.u_factor_unsorted();
        let (symbolic, values) = u.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut log_det = 0.0;
        for col in 0..self.n {
            let pivot = (col_ptr[col]..col_ptr[col + 1])
                .find(|&idx| row_idx[idx] == col)
                .map_or(0.0, |idx| values[idx]);
            log_det += pivot.abs().ln();
        }
        if log_det.is_finite() {
            Ok(log_det)
        } else {
            Err(LinalgError::Singular)
        }
    }

    /// `trace(K^{-1} M)`, solving only for the columns of `M` that hold entries.
    pub fn trace_inverse_product(&self, m: &SparseMatrix) -> Result<f64, LinalgError> {
        if m.nrows() != self.n || m.ncols() != self.n {
            return Err(LinalgError::DimensionMismatch {
                operation: "trace of inverse product",
                left: (self.n, self.n),
                right: (m.nrows(), m.ncols()),
            });
        }
        let (symbolic, values) = m.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let active: Vec<usize> = (0..self.n)
            .filter(|&col| col_ptr[col + 1] > col_ptr[col])
            .collect();

        let mut trace = 0.0;
        for batch in active.chunks(TRACE_BATCH_COLUMNS) {
            let mut rhs = Mat::<f64>::zeros(self.n, batch.len());
            for (slot, &col) in batch.iter().enumerate() {
                for idx in col_ptr[col]..col_ptr[col + 1] {
                    rhs[(row_idx[idx], slot)] += values[idx];
                }
            }
            self.solve_in_place(&mut rhs);
            for (slot, &col) in batch.iter().enumerate() {
                trace += rhs[(col, slot)];
            }
        }
        if trace.is_finite() {
            Ok(trace)
        } else {
            Err(LinalgError::Singular)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tridiagonal(n: usize, diag: f64, off: f64) -> SparseMatrix {
        let mut entries = Vec::new();
        for i in 0..n {
            entries.push((i, i, diag));
            if i + 1 < n {
                entries.push((i + 1, i, off));
                entries.push((i, i + 1, off));
            }
        }
        from_triplets(n, n, &entries).unwrap()
    }

    #[test]
    fn product_matches_dense_product() {
        let a = from_triplets(3, 2, &[(0, 0, 1.0), (2, 0, -2.0), (1, 1, 3.0)]).unwrap();
        let b = from_triplets(2, 3, &[(0, 0, 4.0), (1, 2, 5.0), (0, 1, 1.5)]).unwrap();
        let sparse = to_dense(&product(&a, &b).unwrap());
        let dense = to_dense(&a).dot(&to_dense(&b));
        assert_eq!(sparse, dense);
    }

    #[test]
    fn product_keeps_structural_zeros() {
        let a = from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 1.0)]).unwrap();
        let b = from_triplets(2, 1, &[(0, 0, 1.0), (1, 0, -1.0)]).unwrap();
        let c = product(&a, &b).unwrap();
        assert_eq!(triplets(&c), vec![(0, 0, 0.0)]);
    }

    #[test]
    fn weighted_gram_matches_dense() {
        let a = from_triplets(3, 2, &[(0, 0, 1.0), (1, 0, 2.0), (2, 1, -1.0), (1, 1, 0.5)]).unwrap();
        let w = array![1.0, 2.0, 3.0];
        let gram = to_dense(&weighted_gram(&a, w.view()).unwrap());
        let dense_a = to_dense(&a);
        let expected = dense_a.t().dot(&Array2::from_diag(&w)).dot(&dense_a);
        assert_eq!(gram, expected);
    }

    #[test]
    fn block_diagonal_and_hstack_offsets() {
        let a = identity(2).unwrap();
        let b = from_triplets(1, 1, &[(0, 0, 7.0)]).unwrap();
        let bd = to_dense(&block_diagonal(&[&a, &b]).unwrap());
        assert_eq!(bd, array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 7.0]]);

        let left = from_triplets(2, 1, &[(1, 0, 2.0)]).unwrap();
        let stacked = to_dense(&hstack(&[&left, &a]).unwrap());
        assert_eq!(stacked, array![[0.0, 1.0, 0.0], [2.0, 0.0, 1.0]]);
    }

    #[test]
    fn cholesky_reuses_symbolic_analysis_for_fixed_pattern() {
        let mut solver = SparseCholesky::new("test precision");
        let rhs = Array1::from_elem(5, 1.0);
        for shift in [4.0, 5.0, 6.0] {
            let q = tridiagonal(5, shift, -1.0);
            let factor = solver.factorize(&q).unwrap();
            let x = factor.solve(rhs.view()).unwrap();
            let back = matvec(&q, x.view());
            for (a, b) in back.iter().zip(rhs.iter()) {
                assert!((a - b).abs() < 1e-10);
            }
        }
        assert_eq!(solver.analyses(), 1);
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let mut solver = SparseCholesky::new("indefinite");
        let q = tridiagonal(4, 1.0, -2.0);
        assert!(solver.factorize(&q).is_err());
    }

    #[test]
    fn lu_trace_matches_dense_inverse() {
        let k = from_triplets(
            3,
            3,
            &[(0, 0, 2.0), (1, 0, -0.5), (1, 1, 1.5), (2, 1, 0.3), (2, 2, 1.0), (0, 2, 0.2)],
        )
        .unwrap();
        let m = from_triplets(3, 3, &[(1, 0, -1.0), (2, 1, -1.0), (0, 0, 0.5)]).unwrap();
        let lu = LuFactor::new(&k).unwrap();
        let trace = lu.trace_inverse_product(&m).unwrap();

        let dense_k = to_dense(&k);
        let dense_m = to_dense(&m);
        let mut expected = 0.0;
        for j in 0..3 {
            let x = lu.solve(dense_m.column(j)).unwrap();
            expected += x[j];
            let back = dense_k.dot(&x);
            for i in 0..3 {
                assert!((back[i] - dense_m[[i, j]]).abs() < 1e-12);
            }
        }
        assert!((trace - expected).abs() < 1e-12);
    }

    #[test]
    fn log_abs_det_of_triangular_operator() {
        let k = from_triplets(3, 3, &[(0, 0, 2.0), (1, 0, 5.0), (1, 1, -3.0), (2, 2, 0.5)]).unwrap();
        let lu = LuFactor::new(&k).unwrap();
        assert!((lu.log_abs_det().unwrap() - 3.0_f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn log_abs_det_needs_pivoting_and_matches_dense() {
        // The zero leading entry forces a row exchange.
        let k = from_triplets(
            3,
            3,
            &[(0, 1, 3.0), (1, 0, 1.0), (1, 1, 4.0), (2, 1, -1.0), (2, 2, 2.0), (0, 2, 0.5)],
        )
        .unwrap();
        let dense = to_dense(&k);
        let det = dense[[0, 0]] * (dense[[1, 1]] * dense[[2, 2]] - dense[[1, 2]] * dense[[2, 1]])
            - dense[[0, 1]] * (dense[[1, 0]] * dense[[2, 2]] - dense[[1, 2]] * dense[[2, 0]])
            + dense[[0, 2]] * (dense[[1, 0]] * dense[[2, 1]] - dense[[1, 1]] * dense[[2, 0]]);
        let lu = LuFactor::new(&k).unwrap();
        assert!((lu.log_abs_det().unwrap() - det.abs().ln()).abs() < 1e-10);
    }

    #[test]
    fn log_abs_det_of_long_chain_is_sparse_sized() {
        // Bidiagonal AR(1)-type operator: det is the product of the diagonal.
        let n = 20_000;
        let mut entries: Vec<_> = (0..n).map(|i| (i, i, 1.5)).collect();
        entries.extend((1..n).map(|i| (i, i - 1, -0.7)));
        let k = from_triplets(n, n, &entries).unwrap();
        let lu = LuFactor::new(&k).unwrap();
        assert!((lu.log_abs_det().unwrap() - n as f64 * 1.5_f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn singular_operator_is_rejected() {
        let k = from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 2.0), (1, 0, 2.0), (1, 1, 4.0)]).unwrap();
        let failed = LuFactor::new(&k).and_then(|lu| lu.log_abs_det());
        assert!(matches!(failed, Err(LinalgError::Singular)));
    }
}
