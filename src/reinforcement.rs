//! Reinforcement schedules: decide whether a scored response is consequated.
//!
//! Incorrect responses are always consequated by every schedule; the ratio
//! schedules only thin out rewards.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded when reproducibility is wanted, from OS entropy otherwise.
pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub trait ReinforcementSchedule: Send {
    fn name(&self) -> &'static str;

    /// Returns `true` if the response should be rewarded (when correct) or
    /// punished (when incorrect).
    fn consequate(&mut self, correct: bool) -> bool;
}

/// Every response is consequated.
#[derive(Debug, Clone, Default)]
pub struct ContinuousSchedule;

impl ReinforcementSchedule for ContinuousSchedule {
    fn name(&self) -> &'static str {
        "continuous"
    }

    fn consequate(&mut self, _correct: bool) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct FixedRatioSchedule {
    ratio: u32,
    cumulative_correct: u32,
}

impl FixedRatioSchedule {
    /// A ratio of zero is treated as one.
    pub fn new(ratio: u32) -> Self {
        Self {
            ratio: ratio.max(1),
            cumulative_correct: 0,
        }
    }
}

impl ReinforcementSchedule for FixedRatioSchedule {
    fn name(&self) -> &'static str {
        "fixed_ratio"
    }

    fn consequate(&mut self, correct: bool) -> bool {
        if !correct {
            self.cumulative_correct = 0;
            return true;
        }
        self.cumulative_correct += 1;
        if self.cumulative_correct >= self.ratio {
            self.cumulative_correct = 0;
            true
        } else {
            false
        }
    }
}

/// Like [`FixedRatioSchedule`], with the threshold redrawn uniformly from
/// `[1, 2N-1]` after every consequation (mean N).
#[derive(Debug, Clone)]
pub struct VariableRatioSchedule {
    ratio: u32,
    threshold: u32,
    cumulative_correct: u32,
    rng: StdRng,
}

impl VariableRatioSchedule {
    pub fn new(ratio: u32, seed: Option<u64>) -> Self {
        let mut schedule = Self {
            ratio: ratio.max(1),
            threshold: 1,
            cumulative_correct: 0,
            rng: seeded_rng(seed),
        };
        schedule.redraw();
        schedule
    }

    fn redraw(&mut self) {
        self.cumulative_correct = 0;
        self.threshold = self.rng.gen_range(1..=self.ratio.saturating_mul(2) - 1);
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl ReinforcementSchedule for VariableRatioSchedule {
    fn name(&self) -> &'static str {
        "variable_ratio"
    }

    fn consequate(&mut self, correct: bool) -> bool {
        if !correct {
            self.cumulative_correct = 0;
            return true;
        }
        self.cumulative_correct += 1;
        if self.cumulative_correct >= self.threshold {
            self.redraw();
            true
        } else {
            false
        }
    }
}

/// Correct responses consequated with probability `p`.
#[derive(Debug, Clone)]
pub struct PercentSchedule {
    probability: f64,
    rng: StdRng,
}

impl PercentSchedule {
    pub fn new(probability: f64, seed: Option<u64>) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: seeded_rng(seed),
        }
    }
}

impl ReinforcementSchedule for PercentSchedule {
    fn name(&self) -> &'static str {
        "percent"
    }

    fn consequate(&mut self, correct: bool) -> bool {
        if correct {
            self.rng.gen_bool(self.probability)
        } else {
            true
        }
    }
}
