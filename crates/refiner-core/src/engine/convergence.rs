use crate::model::{ConvergenceReason, RunConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergencePolicy {
    pub target_score: f64,
    pub threshold: f64,
    pub patience: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop(ConvergenceReason),
}

impl From<&RunConfig> for ConvergencePolicy {
    fn from(cfg: &RunConfig) -> Self {
        Self {
            target_score: cfg.target_score,
            threshold: cfg.convergence_threshold,
            patience: cfg.convergence_patience,
            max_iterations: cfg.max_iterations,
        }
    }
}

impl ConvergencePolicy {
    /// `history` holds the average score of every completed iteration, the
    /// current one last. Checked in order: target, stagnation, iteration cap.
    pub fn evaluate(&self, iteration_num: u32, history: &[f64]) -> Decision {
        let Some(&current) = history.last() else {
            return Decision::Continue;
        };
        if current >= self.target_score {
            return Decision::Stop(ConvergenceReason::Target);
        }
        if self.is_stagnant(history) {
            return Decision::Stop(ConvergenceReason::Stagnation);
        }
        if iteration_num >= self.max_iterations {
            return Decision::Stop(ConvergenceReason::MaxIterations);
        }
        Decision::Continue
    }

    fn is_stagnant(&self, history: &[f64]) -> bool {
        let patience = self.patience as usize;
        if patience == 0 || history.len() < patience + 1 {
            return false;
        }
        history[history.len() - patience - 1..]
            .windows(2)
            .all(|w| (w[1] - w[0]).abs() < self.threshold)
    }
}
