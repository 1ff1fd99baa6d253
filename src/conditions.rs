//! Trial conditions: a behavioral contract plus a pool of stimuli.

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::clock::Duration;
use crate::error::UsageError;
use crate::reinforcement::seeded_rng;

#[derive(Debug, Clone, PartialEq)]
pub struct Stimulus {
    pub name: String,
    pub file: Option<PathBuf>,
    /// Playback length; the trial's minimum wait.
    pub duration: Duration,
    pub label: Option<String>,
}

impl Stimulus {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            file: None,
            duration,
            label: None,
        }
    }
}

/// What a condition asks of the subject. Copied onto each trial so the
/// trial never borrows the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub name: String,
    /// Response class that scores as correct.
    pub desired: String,
    pub is_rewarded: bool,
    pub is_punished: bool,
    /// Feed duration; the panel default applies when unset.
    pub reward_value: Option<Duration>,
    /// Timeout duration; the panel default applies when unset.
    pub punish_value: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sampling {
    pub replacement: bool,
    pub shuffle: bool,
}

#[derive(Debug)]
pub struct Condition {
    contract: Contract,
    stimuli: Vec<Stimulus>,
    sampling: Sampling,
    order: Vec<usize>,
    pos: usize,
    rng: StdRng,
}

impl Condition {
    pub fn new(
        contract: Contract,
        stimuli: Vec<Stimulus>,
        sampling: Sampling,
        seed: Option<u64>,
    ) -> Self {
        let mut condition = Self {
            order: (0..stimuli.len()).collect(),
            contract,
            stimuli,
            sampling,
            pos: 0,
            rng: seeded_rng(seed),
        };
        condition.restart();
        condition
    }

    fn restart(&mut self) {
        self.pos = 0;
        if self.sampling.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn name(&self) -> &str {
        &self.contract.name
    }

    pub fn len(&self) -> usize {
        self.stimuli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimuli.is_empty()
    }

    /// Next stimulus under the sampling policy. Without replacement the pool
    /// restarts (reshuffled if configured) once every item has been drawn.
    pub fn get(&mut self) -> Option<Stimulus> {
        if self.stimuli.is_empty() {
            return None;
        }
        if self.sampling.replacement {
            return self.stimuli.choose(&mut self.rng).cloned();
        }
        if self.pos >= self.order.len() {
            self.restart();
        }
        let idx = self.order[self.pos];
        self.pos += 1;
        self.stimuli.get(idx).cloned()
    }

    pub fn get_at(&self, index: usize) -> Result<Stimulus, UsageError> {
        self.stimuli
            .get(index)
            .cloned()
            .ok_or_else(|| UsageError::StimulusOutOfRange {
                condition: self.contract.name.clone(),
                index,
                len: self.stimuli.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Contract {
        Contract {
            name: "left".into(),
            desired: "left".into(),
            is_rewarded: true,
            is_punished: true,
            reward_value: None,
            punish_value: None,
        }
    }

    fn pool(n: usize) -> Vec<Stimulus> {
        (0..n)
            .map(|i| Stimulus::new(format!("s{i}"), Duration::from_millis(500)))
            .collect()
    }

    #[test]
    fn ordered_pool_cycles() {
        let mut c = Condition::new(contract(), pool(3), Sampling::default(), None);
        let names: Vec<String> = (0..7).map(|_| c.get().unwrap().name).collect();
        assert_eq!(names, ["s0", "s1", "s2", "s0", "s1", "s2", "s0"]);
    }

    #[test]
    fn shuffled_pool_draws_each_before_repeating() {
        let sampling = Sampling {
            replacement: false,
            shuffle: true,
        };
        let mut c = Condition::new(contract(), pool(5), sampling, Some(3));
        for _ in 0..3 {
            let mut names: Vec<String> = (0..5).map(|_| c.get().unwrap().name).collect();
            names.sort();
            assert_eq!(names, ["s0", "s1", "s2", "s3", "s4"]);
        }
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let mut c = Condition::new(contract(), Vec::new(), Sampling::default(), None);
        assert!(c.get().is_none());
    }

    #[test]
    fn get_at_checks_range() {
        let c = Condition::new(contract(), pool(2), Sampling::default(), None);
        assert_eq!(c.get_at(1).unwrap().name, "s1");
        assert!(matches!(
            c.get_at(2),
            Err(UsageError::StimulusOutOfRange { index: 2, len: 2, .. })
        ));
    }
}
