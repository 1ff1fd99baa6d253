//! Running counters the daemon writes out for a quick look at a subject.

use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

use crate::error::{ComponentError, StoreError};
use crate::trial::{Reinforcement, Response, Trial};

const RECENT: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub trials: u32,
    pub correct: u32,
    pub incorrect: u32,
    pub no_response: u32,
    pub feeds: u32,
    pub timeouts: u32,
    pub hopper_failures: u32,
    pub hopper_wont_go_down: u32,
    pub hopper_already_up: u32,
    pub sessions: u32,
    #[serde(serialize_with = "rfc3339")]
    pub last_trial_time: Option<DateTime<Local>>,
    #[serde(skip)]
    recent: Vec<bool>,
}

impl Summary {
    pub fn new() -> Self {
        Self {
            trials: 0,
            correct: 0,
            incorrect: 0,
            no_response: 0,
            feeds: 0,
            timeouts: 0,
            hopper_failures: 0,
            hopper_wont_go_down: 0,
            hopper_already_up: 0,
            sessions: 0,
            last_trial_time: None,
            recent: Vec::with_capacity(RECENT),
        }
    }

    pub fn record_trial(&mut self, trial: &Trial) {
        self.trials += 1;
        self.last_trial_time = Some(trial.time);
        match (&trial.response, trial.correct) {
            (Response::None, _) => self.no_response += 1,
            (_, true) => self.correct += 1,
            (_, false) => self.incorrect += 1,
        }
        if !matches!(trial.response, Response::None) {
            self.recent.push(trial.correct);
            if self.recent.len() > RECENT {
                self.recent.remove(0);
            }
        }
        if trial.reward == Reinforcement::Delivered {
            self.feeds += 1;
        }
        if trial.punish == Reinforcement::Delivered {
            self.timeouts += 1;
        }
    }

    pub fn record_fault(&mut self, fault: &ComponentError) {
        match fault {
            ComponentError::HopperWontComeUp => self.hopper_failures += 1,
            ComponentError::HopperWontDrop => self.hopper_wont_go_down += 1,
            ComponentError::HopperAlreadyUp => self.hopper_already_up += 1,
            _ => {}
        }
    }

    /// Fraction correct among answered trials; 0.5 before any answer.
    pub fn accuracy(&self) -> f32 {
        let total = self.correct + self.incorrect;
        if total == 0 {
            0.5
        } else {
            self.correct as f32 / total as f32
        }
    }

    /// Accuracy over the last 100 answered trials.
    pub fn last_100_rate(&self) -> f32 {
        if self.recent.is_empty() {
            return 0.5;
        }
        let start = self.recent.len().saturating_sub(100);
        let slice = &self.recent[start..];
        slice.iter().filter(|&&x| x).count() as f32 / slice.len() as f32
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("accuracy".into(), self.accuracy().into());
            map.insert("last_100_rate".into(), self.last_100_rate().into());
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&value)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn rfc3339<S: Serializer>(time: &Option<DateTime<Local>>, s: S) -> Result<S::Ok, S::Error> {
    match time {
        Some(t) => s.serialize_str(&t.to_rfc3339()),
        None => s.serialize_none(),
    }
}

impl Default for Summary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::tests::sample_trial;

    #[test]
    fn counts_outcomes_and_feeds() {
        let mut summary = Summary::new();

        let mut t = sample_trial();
        t.response = Response::Class("left".into());
        t.correct = true;
        t.reward = Reinforcement::Delivered;
        summary.record_trial(&t);

        t.response = Response::Class("right".into());
        t.correct = false;
        t.reward = Reinforcement::Withheld;
        t.punish = Reinforcement::Delivered;
        summary.record_trial(&t);

        t.response = Response::None;
        t.punish = Reinforcement::Withheld;
        summary.record_trial(&t);

        assert_eq!(summary.trials, 3);
        assert_eq!((summary.correct, summary.incorrect, summary.no_response), (1, 1, 1));
        assert_eq!((summary.feeds, summary.timeouts), (1, 1));
        assert!((summary.accuracy() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn hopper_faults_are_tallied() {
        let mut summary = Summary::new();
        summary.record_fault(&ComponentError::HopperWontComeUp);
        summary.record_fault(&ComponentError::HopperWontDrop);
        summary.record_fault(&ComponentError::HopperAlreadyUp);
        summary.record_fault(&ComponentError::HopperAlreadyUp);
        assert_eq!(summary.hopper_failures, 1);
        assert_eq!(summary.hopper_wont_go_down, 1);
        assert_eq!(summary.hopper_already_up, 2);
    }

    #[test]
    fn written_summary_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        Summary::new().write_to(&path).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["trials"], 0);
        assert!(v.get("accuracy").is_some());
        assert!(v["last_trial_time"].is_null());

        let mut summary = Summary::new();
        let trial = sample_trial();
        summary.record_trial(&trial);
        summary.write_to(&path).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["last_trial_time"], trial.time.to_rfc3339());
    }
}
