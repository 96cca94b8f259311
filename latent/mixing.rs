//! Per-node variance mixing variables.
//!
//! A NIG process carries `V_i ~ GIG(-1/2, ν, ν h_i²)` (an inverse Gaussian with
//! mean `h_i`); a Gaussian process carries the constant `V = h`, which makes the
//! mean term `μ (V - h)` vanish. The shape is stored on the log scale,
//! `θ_V = log ν`.

use crate::random::{Gig, GigError};
use ndarray::{Array1, ArrayView1, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixingFamily {
    #[default]
    Normal,
    Nig,
}

#[derive(Debug, Clone)]
pub struct Mixing {
    family: MixingFamily,
    h: Array1<f64>,
    v: Array1<f64>,
    prev_v: Array1<f64>,
    theta_nu: f64,
    fixed_v: bool,
}

impl Mixing {
    pub fn normal(h: Array1<f64>) -> Self {
        Self {
            family: MixingFamily::Normal,
            v: h.clone(),
            prev_v: h.clone(),
            h,
            theta_nu: 0.0,
            fixed_v: false,
        }
    }

    pub fn nig(h: Array1<f64>, theta_nu: f64) -> Self {
        Self {
            family: MixingFamily::Nig,
            v: h.clone(),
            prev_v: h.clone(),
            h,
            theta_nu,
            fixed_v: false,
        }
    }

    pub fn family(&self) -> MixingFamily {
        self.family
    }

    pub fn is_gaussian(&self) -> bool {
        self.family == MixingFamily::Normal
    }

    pub fn len(&self) -> usize {
        self.h.len()
    }

    pub fn is_empty(&self) -> bool {
        self.h.is_empty()
    }

    pub fn h(&self) -> &Array1<f64> {
        &self.h
    }

    pub fn v(&self) -> &Array1<f64> {
        &self.v
    }

    pub fn prev_v(&self) -> &Array1<f64> {
        &self.prev_v
    }

    pub fn nu(&self) -> f64 {
        self.theta_nu.exp()
    }

    pub fn theta_nu(&self) -> f64 {
        self.theta_nu
    }

    pub fn set_theta_nu(&mut self, theta_nu: f64) {
        self.theta_nu = theta_nu;
    }

    /// Overwrites `V`, moving the current value into `prevV`.
    pub fn set_v(&mut self, v: Array1<f64>) {
        self.prev_v = std::mem::replace(&mut self.v, v);
    }

    /// Replaces both `V` and `prevV`, discarding the lag; used for supplied starting values.
    pub fn reset_v(&mut self, v: Array1<f64>) {
        self.prev_v.assign(&v);
        self.v = v;
    }

    /// Pins `V` at its current value; later sampling calls only refresh `prevV`.
    pub fn fix_v(&mut self) {
        self.fixed_v = true;
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed_v
    }

    fn store(&mut self, draw: Array1<f64>) {
        if self.fixed_v {
            self.prev_v.assign(&self.v);
        } else {
            self.set_v(draw);
        }
    }

    /// Prior draw `V_i ~ GIG(-1/2, ν, ν h_i²)`.
    pub fn sample_unconditional<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(), GigError> {
        if self.is_gaussian() {
            return Ok(());
        }
        let nu = self.nu();
        let mut draw = Array1::zeros(self.len());
        for (slot, &h) in draw.iter_mut().zip(self.h.iter()) {
            *slot = rng.sample(Gig::new(-0.5, nu, nu * h * h)?);
        }
        self.store(draw);
        Ok(())
    }

    /// Gibbs draw `V_i ~ GIG(-1, ν + a_i, ν h_i² + b_i)`.
    ///
    /// The Gaussian likelihood of one node lowers the prior shape `-1/2` by a
    /// further half and adds `a_i`, `b_i` to the rates.
    pub fn sample_conditional<R: Rng + ?Sized>(
        &mut self,
        a_increment: ArrayView1<'_, f64>,
        b_increment: ArrayView1<'_, f64>,
        rng: &mut R,
    ) -> Result<(), GigError> {
        if self.is_gaussian() {
            return Ok(());
        }
        let nu = self.nu();
        let mut draw = Array1::zeros(self.len());
        for ((slot, &h), (&da, &db)) in draw
            .iter_mut()
            .zip(self.h.iter())
            .zip(a_increment.iter().zip(b_increment.iter()))
        {
            *slot = rng.sample(Gig::new(-1.0, nu + da, nu * h * h + db)?);
        }
        self.store(draw);
        Ok(())
    }

    /// Newton ratio for `θ_V = log ν` from the current `V`, a descent direction
    /// for the negative log prior.
    pub fn grad_theta_nu(&self) -> f64 {
        if self.is_gaussian() {
            return 0.0;
        }
        let nu = self.nu();
        let n = self.len() as f64;
        let grad = Zip::from(&self.v).and(&self.h).fold(0.0, |acc, &v, &h| {
            acc + 0.5 / nu + h - 0.5 * v - 0.5 * h * h / v
        });
        let hess = -n / (2.0 * nu * nu);
        grad / (hess * nu + grad)
    }

    /// `log p(V | ν)`; zero for the degenerate Gaussian case.
    pub fn log_density(&self) -> f64 {
        if self.is_gaussian() {
            return 0.0;
        }
        let nu = self.nu();
        Zip::from(&self.v).and(&self.h).fold(0.0, |acc, &v, &h| {
            acc + h.ln() + 0.5 * (nu / (2.0 * PI)).ln() + nu * h
                - 1.5 * v.ln()
                - 0.5 * nu * (v + h * h / v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn gaussian_mixing_is_constant_offset() {
        let mut mixing = Mixing::normal(Array1::ones(4));
        let mut rng = StdRng::seed_from_u64(0);
        mixing.sample_unconditional(&mut rng).unwrap();
        let inc = Array1::from_elem(4, 3.0);
        mixing.sample_conditional(inc.view(), inc.view(), &mut rng).unwrap();
        assert_eq!(mixing.v(), &Array1::ones(4));
        assert_eq!(mixing.grad_theta_nu(), 0.0);
        assert_eq!(mixing.log_density(), 0.0);
    }

    #[test]
    fn conditional_draw_moves_current_value_into_previous() {
        let mut mixing = Mixing::nig(Array1::ones(3), 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        mixing.sample_unconditional(&mut rng).unwrap();
        let before = mixing.v().clone();
        let inc = Array1::from_elem(3, 0.5);
        mixing.sample_conditional(inc.view(), inc.view(), &mut rng).unwrap();
        assert_eq!(mixing.prev_v(), &before);
        assert_ne!(mixing.v(), &before);
    }

    #[test]
    fn prior_draws_have_mean_h() {
        let h = Array1::from_elem(20_000, 2.0);
        let mut mixing = Mixing::nig(h, 1.0_f64.ln());
        let mut rng = StdRng::seed_from_u64(2);
        mixing.sample_unconditional(&mut rng).unwrap();
        let mean = mixing.v().mean().unwrap();
        // Inverse Gaussian with mean 2 and shape 4 has variance 2.
        assert!((mean - 2.0).abs() < 0.04, "mean {mean}");
    }

    #[test]
    fn shape_newton_step_points_towards_the_generating_value() {
        let h = Array1::ones(5_000);
        let mut rng = StdRng::seed_from_u64(3);
        let mut truth = Mixing::nig(h.clone(), 2.0_f64.ln());
        truth.sample_unconditional(&mut rng).unwrap();

        let mut low = Mixing::nig(h.clone(), 0.5_f64.ln());
        low.set_v(truth.v().clone());
        let mut high = Mixing::nig(h, 8.0_f64.ln());
        high.set_v(truth.v().clone());
        // theta <- theta - g must raise a low nu and lower a high one.
        assert!(low.grad_theta_nu() < 0.0);
        assert!(high.grad_theta_nu() > 0.0);
    }

    #[test]
    fn fixed_mixing_keeps_its_value() {
        let mut mixing = Mixing::nig(Array1::ones(3), 0.0);
        mixing.set_v(Array1::from(vec![0.5, 1.5, 2.5]));
        mixing.fix_v();
        let mut rng = StdRng::seed_from_u64(4);
        let inc = Array1::from_elem(3, 1.0);
        mixing.sample_conditional(inc.view(), inc.view(), &mut rng).unwrap();
        assert_eq!(mixing.v(), &Array1::from(vec![0.5, 1.5, 2.5]));
        assert_eq!(mixing.prev_v(), mixing.v());
    }
}
