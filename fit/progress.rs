use std::fmt;

/// Stages reported while fitting a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitProgressStage {
    Optimization,
}

impl FitProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Optimization => "stochastic-gradient optimization",
        }
    }
}

impl fmt::Display for FitProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress of the outer optimization loop.
pub trait FitProgressObserver {
    fn on_stage_start(&mut self, stage: FitProgressStage, total_steps: usize) {
        let _ = (stage, total_steps);
    }
    fn on_iteration(&mut self, iteration: usize, gradient_norm: f64) {
        let _ = (iteration, gradient_norm);
    }
    fn on_stage_finish(&mut self, stage: FitProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}
