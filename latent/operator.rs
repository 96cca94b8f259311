//! Parameterized sparse operators `K(θ)` for latent processes.
//!
//! Every variant is built from two fixed structural matrices, `G` and `C`,
//! supplied with the model. Derivatives are taken with respect to the
//! unconstrained parameter vector, so the reparameterization chain rule is
//! already folded into what [`Operator::derivative`] returns. The sparsity
//! pattern of `K(θ)` and of each `∂K/∂θ_j` depends only on the structural inputs.

use crate::errors::ConfigurationError;
use crate::linalg::{LinalgError, SparseMatrix};
use crate::linalg::sparse::{diagonal_of, linear_combination, product, scale_rows};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Keeps the AR(1) coefficient strictly inside (-1, 1) when `tanh` saturates.
const AR1_BOUND: f64 = 1.0 - f64::EPSILON;

/// How `∂K/∂θ_j` is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeMode {
    #[default]
    Analytic,
    Forward,
    Central,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaternExponent {
    Two,
    Four,
}

impl MaternExponent {
    pub fn from_alpha(alpha: u32) -> Result<Self, ConfigurationError> {
        match alpha {
            2 => Ok(MaternExponent::Two),
            4 => Ok(MaternExponent::Four),
            other => Err(ConfigurationError::UnsupportedExponent(other)),
        }
    }

    pub fn alpha(self) -> u32 {
        match self {
            MaternExponent::Two => 2,
            MaternExponent::Four => 4,
        }
    }
}

#[derive(Debug, Clone)]
enum Family {
    Ar1,
    Matern(MaternExponent),
    NonStationaryMatern {
        exponent: MaternExponent,
        b_kappa: Array2<f64>,
    },
}

/// AR(1) coefficient for unconstrained `θ = log((1 + α) / (1 - α))`.
pub fn ar1_to_constrained(theta: f64) -> f64 {
    (0.5 * theta).tanh().clamp(-AR1_BOUND, AR1_BOUND)
}

pub fn ar1_to_unconstrained(alpha: f64) -> f64 {
    ((1.0 + alpha) / (1.0 - alpha)).ln()
}

#[derive(Debug, Clone)]
pub struct Operator {
    family: Family,
    g: SparseMatrix,
    c: SparseMatrix,
    /// `diag(C)^{-1/2}`; only read by the Matérn variants.
    d_inv_sqrt: Array1<f64>,
    derivative: DerivativeMode,
    eps: f64,
}

fn check_structure(g: &SparseMatrix, c: &SparseMatrix) -> Result<usize, ConfigurationError> {
    for (name, m) in [("G", g), ("C", c)] {
        if m.nrows() != m.ncols() {
            return Err(ConfigurationError::NotSquare {
                context: format!("structural matrix {name}"),
                nrows: m.nrows(),
                ncols: m.ncols(),
            });
        }
    }
    if g.nrows() != c.nrows() {
        return Err(ConfigurationError::DimensionMismatch {
            context: "structural matrix C against G".to_string(),
            expected: g.nrows(),
            found: c.nrows(),
        });
    }
    Ok(g.nrows())
}

fn mass_scaling(c: &SparseMatrix) -> Result<Array1<f64>, ConfigurationError> {
    let d = diagonal_of(c);
    if let Some(bad) = d.iter().position(|&v| !(v > 0.0 && v.is_finite())) {
        return Err(ConfigurationError::Invalid {
            context: "structural matrix C".to_string(),
            reason: format!("diagonal entry {bad} is {}, a positive value is required", d[bad]),
        });
    }
    Ok(d.mapv(|v| v.sqrt().recip()))
}

impl Operator {
    /// `K = G + α C` with `α = ar1_to_constrained(θ)`.
    pub fn ar1(g: SparseMatrix, c: SparseMatrix) -> Result<Self, ConfigurationError> {
        let n = check_structure(&g, &c)?;
        Ok(Self {
            family: Family::Ar1,
            g,
            c,
            d_inv_sqrt: Array1::ones(n),
            derivative: DerivativeMode::Analytic,
            eps: 1e-3,
        })
    }

    /// `K = D^{-1/2}(G + κ² C)` for `alpha = 2`, its square for `alpha = 4`; `θ = log κ`.
    pub fn matern(g: SparseMatrix, c: SparseMatrix, alpha: u32) -> Result<Self, ConfigurationError> {
        let exponent = MaternExponent::from_alpha(alpha)?;
        check_structure(&g, &c)?;
        let d_inv_sqrt = mass_scaling(&c)?;
        Ok(Self {
            family: Family::Matern(exponent),
            g,
            c,
            d_inv_sqrt,
            derivative: DerivativeMode::Analytic,
            eps: 1e-3,
        })
    }

    /// Matérn operator with `log κ = B_κ θ` varying over the mesh.
    pub fn nonstationary_matern(
        g: SparseMatrix,
        c: SparseMatrix,
        alpha: u32,
        b_kappa: Array2<f64>,
    ) -> Result<Self, ConfigurationError> {
        let exponent = MaternExponent::from_alpha(alpha)?;
        let n = check_structure(&g, &c)?;
        if b_kappa.nrows() != n {
            return Err(ConfigurationError::DimensionMismatch {
                context: "rows of the kappa basis B_kappa".to_string(),
                expected: n,
                found: b_kappa.nrows(),
            });
        }
        if b_kappa.ncols() == 0 {
            return Err(ConfigurationError::Invalid {
                context: "kappa basis B_kappa".to_string(),
                reason: "at least one basis column is required".to_string(),
            });
        }
        let d_inv_sqrt = mass_scaling(&c)?;
        Ok(Self {
            family: Family::NonStationaryMatern { exponent, b_kappa },
            g,
            c,
            d_inv_sqrt,
            derivative: DerivativeMode::Analytic,
            eps: 1e-3,
        })
    }

    pub fn with_derivative(mut self, mode: DerivativeMode, eps: f64) -> Result<Self, ConfigurationError> {
        if !(eps > 0.0 && eps.is_finite()) {
            return Err(ConfigurationError::Invalid {
                context: "finite-difference step eps".to_string(),
                reason: format!("must be positive, found {eps}"),
            });
        }
        self.derivative = mode;
        self.eps = eps;
        Ok(self)
    }

    pub fn n_params(&self) -> usize {
        match &self.family {
            Family::Ar1 | Family::Matern(_) => 1,
            Family::NonStationaryMatern { b_kappa, .. } => b_kappa.ncols(),
        }
    }

    pub fn n_mesh(&self) -> usize {
        self.g.nrows()
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn derivative_mode(&self) -> DerivativeMode {
        self.derivative
    }

    pub fn kind(&self) -> &'static str {
        match &self.family {
            Family::Ar1 => "ar1",
            Family::Matern(_) => "matern",
            Family::NonStationaryMatern { .. } => "matern_nonstationary",
        }
    }

    /// Operator parameters on their natural scale: `α` for AR(1), `κ` for the
    /// stationary Matérn, the `log κ` basis coefficients otherwise.
    pub fn natural_parameters(&self, theta: ArrayView1<'_, f64>) -> Array1<f64> {
        match &self.family {
            Family::Ar1 => theta.mapv(ar1_to_constrained),
            Family::Matern(_) => theta.mapv(f64::exp),
            Family::NonStationaryMatern { .. } => theta.to_owned(),
        }
    }

    fn check_theta(&self, theta: ArrayView1<'_, f64>) -> Result<(), LinalgError> {
        if theta.len() != self.n_params() {
            return Err(LinalgError::DimensionMismatch {
                operation: "operator parameters",
                left: (self.n_params(), 1),
                right: (theta.len(), 1),
            });
        }
        Ok(())
    }

    /// Squared range parameter at every mesh node.
    fn kappa_sq(&self, theta: ArrayView1<'_, f64>) -> Array1<f64> {
        match &self.family {
            Family::NonStationaryMatern { b_kappa, .. } => b_kappa.dot(&theta).mapv(|x| (2.0 * x).exp()),
            _ => Array1::from_elem(self.n_mesh(), (2.0 * theta[0]).exp()),
        }
    }

    /// `D^{-1/2}(G + diag(κ²) C)`.
    fn second_order(&self, kappa_sq: &Array1<f64>) -> Result<SparseMatrix, LinalgError> {
        let scaled_c = scale_rows(&self.c, kappa_sq.view())?;
        let m = linear_combination(&[(1.0, &self.g), (1.0, &scaled_c)])?;
        scale_rows(&m, self.d_inv_sqrt.view())
    }

    pub fn build(&self, theta: ArrayView1<'_, f64>) -> Result<SparseMatrix, LinalgError> {
        self.check_theta(theta)?;
        match &self.family {
            Family::Ar1 => {
                let alpha = ar1_to_constrained(theta[0]);
                linear_combination(&[(1.0, &self.g), (alpha, &self.c)])
            }
            Family::Matern(exponent) | Family::NonStationaryMatern { exponent, .. } => {
                let k2 = self.second_order(&self.kappa_sq(theta))?;
                match exponent {
                    MaternExponent::Two => Ok(k2),
                    MaternExponent::Four => product(&k2, &k2),
                }
            }
        }
    }

    /// `∂K/∂θ_index`, analytic or finite-differenced according to the configured mode.
    pub fn derivative(&self, index: usize, theta: ArrayView1<'_, f64>) -> Result<SparseMatrix, LinalgError> {
        match self.derivative {
            DerivativeMode::Analytic => self.analytic_derivative(index, theta),
            mode => self.numeric_derivative(index, theta, mode),
        }
    }

    pub fn analytic_derivative(
        &self,
        index: usize,
        theta: ArrayView1<'_, f64>,
    ) -> Result<SparseMatrix, LinalgError> {
        self.check_theta(theta)?;
        self.check_index(index)?;
        match &self.family {
            Family::Ar1 => {
                let alpha = ar1_to_constrained(theta[0]);
                linear_combination(&[(0.5 * (1.0 - alpha * alpha), &self.c)])
            }
            Family::Matern(exponent) | Family::NonStationaryMatern { exponent, .. } => {
                let kappa_sq = self.kappa_sq(theta);
                let d_kappa_sq = match &self.family {
                    Family::NonStationaryMatern { b_kappa, .. } => {
                        2.0 * &kappa_sq * &b_kappa.column(index)
                    }
                    _ => 2.0 * &kappa_sq,
                };
                let dk2 = scale_rows(&scale_rows(&self.c, d_kappa_sq.view())?, self.d_inv_sqrt.view())?;
                match exponent {
                    MaternExponent::Two => Ok(dk2),
                    MaternExponent::Four => {
                        let k2 = self.second_order(&kappa_sq)?;
                        let left = product(&dk2, &k2)?;
                        let right = product(&k2, &dk2)?;
                        linear_combination(&[(1.0, &left), (1.0, &right)])
                    }
                }
            }
        }
    }

    fn numeric_derivative(
        &self,
        index: usize,
        theta: ArrayView1<'_, f64>,
        mode: DerivativeMode,
    ) -> Result<SparseMatrix, LinalgError> {
        self.check_theta(theta)?;
        self.check_index(index)?;
        let shifted = |delta: f64| {
            let mut moved = theta.to_owned();
            moved[index] += delta;
            self.build(moved.view())
        };
        let plus = shifted(self.eps)?;
        match mode {
            DerivativeMode::Central => {
                let minus = shifted(-self.eps)?;
                let scale = 0.5 / self.eps;
                linear_combination(&[(scale, &plus), (-scale, &minus)])
            }
            _ => {
                let base = self.build(theta)?;
                linear_combination(&[(1.0 / self.eps, &plus), (-1.0 / self.eps, &base)])
            }
        }
    }

    fn check_index(&self, index: usize) -> Result<(), LinalgError> {
        if index >= self.n_params() {
            return Err(LinalgError::DimensionMismatch {
                operation: "operator derivative index",
                left: (self.n_params(), 1),
                right: (index + 1, 1),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::{from_triplets, to_dense};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Piecewise-linear finite elements on a regular 1-D mesh.
    fn fem_1d(n: usize) -> (SparseMatrix, SparseMatrix) {
        let mut g = Vec::new();
        let mut c = Vec::new();
        for i in 0..n {
            let edge = i == 0 || i + 1 == n;
            g.push((i, i, if edge { 1.0 } else { 2.0 }));
            c.push((i, i, if edge { 1.0 / 3.0 } else { 2.0 / 3.0 }));
            if i + 1 < n {
                for (r, s) in [(i, i + 1), (i + 1, i)] {
                    g.push((r, s, -1.0));
                    c.push((r, s, 1.0 / 6.0));
                }
            }
        }
        (from_triplets(n, n, &g).unwrap(), from_triplets(n, n, &c).unwrap())
    }

    fn ar1_structure(n: usize) -> (SparseMatrix, SparseMatrix) {
        let g: Vec<_> = (0..n).map(|i| (i, i, 1.0)).collect();
        let c: Vec<_> = (1..n).map(|i| (i, i - 1, -1.0)).collect();
        (from_triplets(n, n, &g).unwrap(), from_triplets(n, n, &c).unwrap())
    }

    fn max_abs_diff(a: &SparseMatrix, b: &SparseMatrix) -> f64 {
        let (a, b) = (to_dense(a), to_dense(b));
        (&a - &b).iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }

    fn central_difference(op: &Operator, index: usize, theta: &Array1<f64>, h: f64) -> SparseMatrix {
        let mut plus = theta.clone();
        plus[index] += h;
        let mut minus = theta.clone();
        minus[index] -= h;
        let kp = op.build(plus.view()).unwrap();
        let km = op.build(minus.view()).unwrap();
        linear_combination(&[(0.5 / h, &kp), (-0.5 / h, &km)]).unwrap()
    }

    fn check_derivatives(op: &Operator, rng: &mut StdRng) {
        for _ in 0..5 {
            let theta: Array1<f64> = (0..op.n_params()).map(|_| rng.gen_range(-1.0..1.0)).collect();
            for j in 0..op.n_params() {
                let analytic = op.analytic_derivative(j, theta.view()).unwrap();
                let numeric = central_difference(op, j, &theta, 1e-5);
                let scale = to_dense(&analytic).iter().fold(1.0_f64, |m, v| m.max(v.abs()));
                let err = max_abs_diff(&analytic, &numeric);
                assert!(err < 1e-6 * scale, "{} param {j}: error {err}", op.kind());
            }
        }
    }

    #[test]
    fn analytic_derivatives_match_central_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let (g, c) = ar1_structure(6);
        check_derivatives(&Operator::ar1(g, c).unwrap(), &mut rng);

        for alpha in [2, 4] {
            let (g, c) = fem_1d(7);
            check_derivatives(&Operator::matern(g, c, alpha).unwrap(), &mut rng);

            let (g, c) = fem_1d(7);
            let b_kappa = Array2::from_shape_fn((7, 3), |(i, j)| match j {
                0 => 1.0,
                1 => i as f64 / 6.0,
                _ => (i as f64 / 6.0).powi(2),
            });
            check_derivatives(&Operator::nonstationary_matern(g, c, alpha, b_kappa).unwrap(), &mut rng);
        }
    }

    #[test]
    fn numeric_derivative_modes_approach_the_analytic_one() {
        let (g, c) = fem_1d(5);
        let theta = Array1::from(vec![0.3]);
        let analytic = Operator::matern(g.clone(), c.clone(), 4)
            .unwrap()
            .analytic_derivative(0, theta.view())
            .unwrap();
        let central = Operator::matern(g.clone(), c.clone(), 4)
            .unwrap()
            .with_derivative(DerivativeMode::Central, 1e-4)
            .unwrap();
        let forward = Operator::matern(g, c, 4)
            .unwrap()
            .with_derivative(DerivativeMode::Forward, 1e-6)
            .unwrap();
        assert!(max_abs_diff(&analytic, &central.derivative(0, theta.view()).unwrap()) < 1e-4);
        assert!(max_abs_diff(&analytic, &forward.derivative(0, theta.view()).unwrap()) < 1e-3);
    }

    #[test]
    fn ar1_reparameterization_round_trips() {
        let mut theta = -15.0;
        while theta <= 15.0 {
            let alpha = ar1_to_constrained(theta);
            assert!(alpha > -1.0 && alpha < 1.0);
            assert!((ar1_to_unconstrained(alpha) - theta).abs() < 1e-6, "theta {theta}");
            theta += 0.25;
        }
        for extreme in [-1e3, -60.0, 60.0, 1e3] {
            let alpha = ar1_to_constrained(extreme);
            assert!(alpha > -1.0 && alpha < 1.0, "theta {extreme} gave {alpha}");
        }
    }

    #[test]
    fn operator_pattern_does_not_depend_on_theta() {
        let (g, c) = fem_1d(6);
        let op = Operator::matern(g, c, 4).unwrap();
        let a = op.build(Array1::from(vec![-0.7]).view()).unwrap();
        let b = op.build(Array1::from(vec![1.9]).view()).unwrap();
        assert_eq!(a.symbolic().col_ptr(), b.symbolic().col_ptr());
        assert_eq!(a.symbolic().row_idx(), b.symbolic().row_idx());
    }

    #[test]
    fn ar1_operator_has_expected_entries() {
        let (g, c) = ar1_structure(3);
        let op = Operator::ar1(g, c).unwrap();
        let theta = ar1_to_unconstrained(0.5);
        let k = to_dense(&op.build(Array1::from(vec![theta]).view()).unwrap());
        assert!((k[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((k[[1, 0]] + 0.5).abs() < 1e-12);
        assert!((k[[2, 1]] + 0.5).abs() < 1e-12);
        assert_eq!(k[[0, 1]], 0.0);
    }

    #[test]
    fn invalid_structure_is_rejected() {
        let (g, c) = fem_1d(4);
        assert!(matches!(
            Operator::matern(g.clone(), c.clone(), 3),
            Err(ConfigurationError::UnsupportedExponent(3))
        ));

        let rectangular = from_triplets(4, 3, &[(0, 0, 1.0)]).unwrap();
        assert!(matches!(
            Operator::ar1(rectangular, c.clone()),
            Err(ConfigurationError::NotSquare { .. })
        ));

        let (small_g, _) = fem_1d(3);
        assert!(matches!(
            Operator::matern(small_g, c.clone(), 2),
            Err(ConfigurationError::DimensionMismatch { .. })
        ));

        let wrong_rows = Array2::<f64>::ones((3, 2));
        assert!(matches!(
            Operator::nonstationary_matern(g.clone(), c, 2, wrong_rows),
            Err(ConfigurationError::DimensionMismatch { .. })
        ));

        let singular_mass = from_triplets(4, 4, &[(0, 0, 1.0), (1, 1, 1.0), (2, 2, 0.0), (3, 3, 1.0)]).unwrap();
        assert!(matches!(
            Operator::matern(g.clone(), singular_mass, 2),
            Err(ConfigurationError::Invalid { .. })
        ));

        let op = Operator::matern(g, fem_1d(4).1, 2).unwrap();
        assert!(op.build(Array1::from(vec![0.1, 0.2]).view()).is_err());
    }
}
