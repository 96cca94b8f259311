//! Per-parameter step sizes and permanent block freezing.
//!
//! Each scalar parameter has its own clock: whenever `|g_i|` exceeds the
//! threshold the clock restarts, and between exceedances the step size decays
//! as `(t - last_i)^(-kill_power)`. A latent parameter block is frozen for the
//! rest of the run once all of its entries have stayed below `term_eps` for
//! `term_window` consecutive examinations.

use crate::latent::ParameterBlock;
use ndarray::{Array1, s};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleSettings {
    pub kill_power: f64,
    pub threshold: f64,
    pub term_eps: f64,
    pub term_window: usize,
}

/// Location of one latent parameter block inside the joint vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSlot {
    pub process: usize,
    pub block: ParameterBlock,
    pub range: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct StepSchedule {
    settings: ScheduleSettings,
    slots: Vec<BlockSlot>,
    last_exceed: Vec<usize>,
    quiet_runs: Vec<usize>,
    frozen: Vec<bool>,
    step_sizes: Array1<f64>,
}

impl StepSchedule {
    pub fn new(settings: ScheduleSettings, n_params: usize, slots: Vec<BlockSlot>) -> Self {
        let n_slots = slots.len();
        Self {
            settings,
            slots,
            last_exceed: vec![0; n_params],
            quiet_runs: vec![0; n_slots],
            frozen: vec![false; n_slots],
            step_sizes: Array1::ones(n_params),
        }
    }

    pub fn step_sizes(&self) -> &Array1<f64> {
        &self.step_sizes
    }

    pub fn slots(&self) -> &[BlockSlot] {
        &self.slots
    }

    /// Updates the clocks with the gradient of outer iteration `iteration`
    /// (counted from 1) and returns the blocks frozen by this call.
    ///
    /// `already_frozen[k]` reports whether slot `k` was fixed before the run or
    /// by an earlier call; such slots never count towards a new freeze.
    pub fn examine(&mut self, iteration: usize, gradient: &Array1<f64>, already_frozen: &[bool]) -> Vec<BlockSlot> {
        for (i, g) in gradient.iter().enumerate() {
            if g.abs() > self.settings.threshold {
                self.last_exceed[i] = iteration.saturating_sub(1);
            }
            let elapsed = iteration.saturating_sub(self.last_exceed[i]).max(1) as f64;
            self.step_sizes[i] = elapsed.powf(-self.settings.kill_power);
        }

        let mut newly_frozen = Vec::new();
        for (k, slot) in self.slots.iter().enumerate() {
            if self.frozen[k] || already_frozen.get(k).copied().unwrap_or(false) {
                self.frozen[k] = true;
                continue;
            }
            let quiet = gradient
                .slice(s![slot.range.clone()])
                .iter()
                .all(|g| g.abs() < self.settings.term_eps);
            self.quiet_runs[k] = if quiet { self.quiet_runs[k] + 1 } else { 0 };
            if self.quiet_runs[k] >= self.settings.term_window {
                self.frozen[k] = true;
                newly_frozen.push(slot.clone());
            }
        }
        newly_frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ScheduleSettings {
        ScheduleSettings {
            kill_power: 0.5,
            threshold: 1.0,
            term_eps: 1e-3,
            term_window: 2,
        }
    }

    fn slot(range: Range<usize>) -> BlockSlot {
        BlockSlot {
            process: 0,
            block: ParameterBlock::Operator,
            range,
        }
    }

    #[test]
    fn step_decays_from_the_last_exceedance() {
        let mut schedule = StepSchedule::new(settings(), 2, vec![]);
        schedule.examine(1, &Array1::from(vec![5.0, 0.1]), &[]);
        assert_eq!(schedule.step_sizes()[0], 1.0);
        assert_eq!(schedule.step_sizes()[1], 1.0);

        schedule.examine(2, &Array1::from(vec![0.1, 0.1]), &[]);
        assert!((schedule.step_sizes()[0] - 0.5_f64.sqrt()).abs() < 1e-12);
        assert!((schedule.step_sizes()[1] - 0.5_f64.sqrt()).abs() < 1e-12);

        schedule.examine(5, &Array1::from(vec![3.0, 0.1]), &[]);
        assert_eq!(schedule.step_sizes()[0], 1.0);
        assert!((schedule.step_sizes()[1] - 0.2_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn block_freezes_after_a_quiet_window_only_once() {
        let mut schedule = StepSchedule::new(settings(), 3, vec![slot(0..2), slot(2..3)]);
        let quiet_first = Array1::from(vec![1e-4, -1e-4, 0.5]);
        assert!(schedule.examine(1, &quiet_first, &[false, false]).is_empty());
        let frozen = schedule.examine(2, &quiet_first, &[false, false]);
        assert_eq!(frozen, vec![slot(0..2)]);
        assert!(schedule.examine(3, &quiet_first, &[true, false]).is_empty());
    }

    #[test]
    fn a_loud_iteration_resets_the_window() {
        let mut schedule = StepSchedule::new(settings(), 1, vec![slot(0..1)]);
        schedule.examine(1, &Array1::from(vec![1e-4]), &[false]);
        schedule.examine(2, &Array1::from(vec![0.2]), &[false]);
        assert!(schedule.examine(3, &Array1::from(vec![1e-4]), &[false]).is_empty());
        assert_eq!(schedule.examine(4, &Array1::from(vec![1e-4]), &[false]).len(), 1);
    }

    #[test]
    fn pre_frozen_blocks_are_never_reported() {
        let mut schedule = StepSchedule::new(settings(), 1, vec![slot(0..1)]);
        for t in 1..5 {
            assert!(schedule.examine(t, &Array1::zeros(1), &[true]).is_empty());
        }
    }
}
