//! Typed experiment configuration, validated once after loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::blocks::{Block, BlockFactory, BlockOrder};
use crate::clock::Duration;
use crate::conditions::{Condition, Contract, Sampling, Stimulus};
use crate::error::{ConfigError, Error};
use crate::experiment::ExperimentOptions;
use crate::panel::PanelLayout;
use crate::queues::{
    AdaptiveQueue, BlockQueue, DoubleStaircase, DoubleStaircaseReinforced, EasySampling,
    KaernbachParams, KaernbachStaircase, MixedAdaptiveQueue, Queue, RandomQueue, SubQueue,
};
use crate::reinforcement::{
    ContinuousSchedule, FixedRatioSchedule, PercentSchedule, ReinforcementSchedule,
    VariableRatioSchedule,
};
use crate::schedulers::{
    parse_time_of_day, CountScheduler, Location, StateSchedulers, TimeOfDayScheduler,
    TimeScheduler, Windows,
};
use crate::snapshot::FileSnapshotStore;
use crate::trial::{CorrectionPolicy, TrialOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub subject: String,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub panel: PanelLayout,
    pub blocks: Vec<BlockConfig>,
    #[serde(default)]
    pub block_order: BlockOrder,
    #[serde(default)]
    pub session: ScheduleConfig,
    /// When the subject should be left in the dark. Usually `night`.
    #[serde(default)]
    pub sleep: Option<WindowsConfig>,
    #[serde(default)]
    pub num_sessions: Option<u32>,
    #[serde(default)]
    pub correction: CorrectionPolicy,
    #[serde(default = "default_response_window_s")]
    pub response_window_s: f64,
    #[serde(default)]
    pub intertrial_min_s: f64,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: f64,
    #[serde(default = "default_recover_wait_s")]
    pub recover_wait_s: f64,
    #[serde(default = "default_hardware_fault_limit")]
    pub hardware_fault_limit: u32,
}

fn default_response_window_s() -> f64 {
    2.0
}
fn default_poll_interval_s() -> f64 {
    60.0
}
fn default_recover_wait_s() -> f64 {
    60.0
}
fn default_hardware_fault_limit() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

/// Session activation: all given constraints must hold.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub windows: Option<WindowsConfig>,
    #[serde(default)]
    pub duration_min: Option<f64>,
    #[serde(default)]
    pub interval_min: Option<f64>,
    #[serde(default)]
    pub max_trials: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowsConfig {
    /// `["HH:MM", "HH:MM"]` pairs.
    Periods { periods: Vec<(String, String)> },
    Sun { latitude: f64, longitude: f64 },
    Night { latitude: f64, longitude: f64 },
}

impl WindowsConfig {
    pub fn to_windows(&self) -> Result<Windows, ConfigError> {
        Ok(match self {
            Self::Periods { periods } => Windows::Periods(
                periods
                    .iter()
                    .map(|(s, e)| Ok((parse_time_of_day(s)?, parse_time_of_day(e)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            Self::Sun {
                latitude,
                longitude,
            } => Windows::Sun(location(*latitude, *longitude)?),
            Self::Night {
                latitude,
                longitude,
            } => Windows::Night(location(*latitude, *longitude)?),
        })
    }
}

fn location(latitude: f64, longitude: f64) -> Result<Location, ConfigError> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(ConfigError::invalid(
            "windows",
            format!("bad location {latitude}, {longitude}"),
        ));
    }
    Ok(Location {
        latitude,
        longitude,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub conditions: Vec<ConditionConfig>,
    pub queue: QueueConfig,
    #[serde(default)]
    pub reinforcement: ReinforcementConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub name: String,
    /// Correct response class; defaults to the condition name.
    #[serde(default)]
    pub desired: Option<String>,
    #[serde(default = "default_true")]
    pub is_rewarded: bool,
    #[serde(default = "default_true")]
    pub is_punished: bool,
    #[serde(default)]
    pub reward_value_s: Option<f64>,
    #[serde(default)]
    pub punish_value_s: Option<f64>,
    pub stimuli: Vec<StimulusConfig>,
    #[serde(default)]
    pub replacement: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusConfig {
    pub name: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    pub duration_s: f64,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueConfig {
    Random {
        #[serde(default)]
        weights: Option<Vec<u32>>,
        #[serde(default)]
        max_items: Option<usize>,
    },
    Block {
        #[serde(default = "default_reps")]
        reps: usize,
        #[serde(default)]
        shuffle: bool,
    },
    Kaernbach {
        #[serde(default)]
        params: KaernbachParams,
    },
    DoubleStaircase {
        #[serde(default = "default_rate_constant")]
        rate_constant: f64,
    },
    DoubleStaircaseReinforced {
        #[serde(default = "default_rate_constant")]
        rate_constant: f64,
        #[serde(default = "default_probe_rate")]
        probe_rate: f64,
        #[serde(default = "default_easy")]
        easy: EasySampling,
    },
    Mixed {
        queues: Vec<SubQueueConfig>,
        #[serde(default)]
        weights: Option<Vec<f64>>,
        snapshot: PathBuf,
    },
}

fn default_reps() -> usize {
    1
}
fn default_rate_constant() -> f64 {
    0.05
}
fn default_probe_rate() -> f64 {
    0.1
}
fn default_easy() -> EasySampling {
    EasySampling::Uniform
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQueueConfig {
    pub queue: QueueConfig,
    /// Block condition index for each condition the sub-queue selects.
    #[serde(default)]
    pub conditions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReinforcementConfig {
    #[default]
    Continuous,
    FixedRatio {
        ratio: u32,
    },
    VariableRatio {
        ratio: u32,
    },
    Percent {
        probability: f64,
    },
}

impl ReinforcementConfig {
    pub fn build(&self, seed: Option<u64>) -> Box<dyn ReinforcementSchedule> {
        match *self {
            Self::Continuous => Box::new(ContinuousSchedule),
            Self::FixedRatio { ratio } => Box::new(FixedRatioSchedule::new(ratio)),
            Self::VariableRatio { ratio } => Box::new(VariableRatioSchedule::new(ratio, seed)),
            Self::Percent { probability } => Box::new(PercentSchedule::new(probability, seed)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::FixedRatio { ratio } | Self::VariableRatio { ratio } if ratio == 0 => Err(
                ConfigError::invalid("reinforcement.ratio", "must be at least 1"),
            ),
            Self::FixedRatio { ratio } | Self::VariableRatio { ratio } if ratio > MAX_RATIO => {
                Err(ConfigError::invalid(
                    "reinforcement.ratio",
                    format!("{ratio} exceeds {MAX_RATIO}"),
                ))
            }
            Self::Percent { probability } if !(0.0..=1.0).contains(&probability) => Err(
                ConfigError::invalid("reinforcement.probability", "must be in [0, 1]"),
            ),
            _ => Ok(()),
        }
    }
}

/// Largest ratio a fixed or variable ratio schedule accepts.
pub const MAX_RATIO: u32 = 10_000;

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    if !(value >= 0.0 && value.is_finite()) {
        return Err(ConfigError::invalid(field, format!("{value} is not a duration")));
    }
    Ok(Duration::from_secs_f64(value))
}

impl ConditionConfig {
    fn build(&self, seed: Option<u64>) -> Result<Condition, ConfigError> {
        let stimuli = self
            .stimuli
            .iter()
            .map(|s| {
                Ok(Stimulus {
                    name: s.name.clone(),
                    file: s.file.clone(),
                    duration: seconds("stimuli.duration_s", s.duration_s)?,
                    label: Some(s.label.clone().unwrap_or_else(|| self.desired().to_owned())),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let contract = Contract {
            name: self.name.clone(),
            desired: self.desired().to_owned(),
            is_rewarded: self.is_rewarded,
            is_punished: self.is_punished,
            reward_value: self
                .reward_value_s
                .map(|v| seconds("reward_value_s", v))
                .transpose()?,
            punish_value: self
                .punish_value_s
                .map(|v| seconds("punish_value_s", v))
                .transpose()?,
        };
        let sampling = Sampling {
            replacement: self.replacement,
            shuffle: self.shuffle,
        };
        Ok(Condition::new(contract, stimuli, sampling, seed))
    }

    fn desired(&self) -> &str {
        self.desired.as_deref().unwrap_or(&self.name)
    }
}

impl QueueConfig {
    fn kind(&self) -> &'static str {
        match self {
            Self::Random { .. } => "random",
            Self::Block { .. } => "block",
            Self::Kaernbach { .. } => "kaernbach",
            Self::DoubleStaircase { .. } => "double_staircase",
            Self::DoubleStaircaseReinforced { .. } => "double_staircase_reinforced",
            Self::Mixed { .. } => "mixed",
        }
    }

    /// Number of block conditions the queue selects among.
    fn arity(&self, n_conditions: usize) -> usize {
        match self {
            Self::Kaernbach { .. } => 1,
            Self::DoubleStaircase { .. } | Self::DoubleStaircaseReinforced { .. } => 2,
            _ => n_conditions,
        }
    }

    /// An adaptive queue over a continuum of `len` stimuli.
    fn adaptive(&self, len: usize, seed: Option<u64>) -> Result<AdaptiveQueue, ConfigError> {
        Ok(match self {
            Self::Kaernbach { params } => AdaptiveQueue::Kaernbach(KaernbachStaircase::new(
                params.clone(),
            )?),
            &Self::DoubleStaircase { rate_constant } => {
                AdaptiveQueue::DoubleStaircase(DoubleStaircase::new(len, rate_constant, seed)?)
            }
            &Self::DoubleStaircaseReinforced {
                rate_constant,
                probe_rate,
                easy,
            } => AdaptiveQueue::DoubleStaircaseReinforced(DoubleStaircaseReinforced::new(
                len,
                rate_constant,
                probe_rate,
                easy,
                seed,
            )?),
            other => {
                return Err(ConfigError::invalid(
                    "queue.mixed.queues",
                    format!("{} is not an adaptive queue", other.kind()),
                ))
            }
        })
    }

    /// Build the queue for a block with these conditions. Staircases address
    /// the stimulus list of their first condition as the continuum.
    pub fn build(&self, conditions: &[Condition], seed: Option<u64>) -> Result<Box<dyn Queue>, Error> {
        let n = conditions.len();
        let continuum = |mapping: &[usize]| {
            let first = mapping.first().copied().unwrap_or(0);
            conditions.get(first).map_or(0, Condition::len)
        };
        Ok(match self {
            Self::Random { weights, max_items } => Box::new(RandomQueue::new(
                n,
                weights.as_deref(),
                *max_items,
                seed,
            )?),
            &Self::Block { reps, shuffle } => Box::new(BlockQueue::new(n, reps, shuffle, seed)),
            Self::Kaernbach { params } => Box::new(KaernbachStaircase::new(params.clone())?),
            &Self::DoubleStaircase { rate_constant } => {
                Box::new(DoubleStaircase::new(continuum(&[]), rate_constant, seed)?)
            }
            &Self::DoubleStaircaseReinforced {
                rate_constant,
                probe_rate,
                easy,
            } => Box::new(DoubleStaircaseReinforced::new(
                continuum(&[]),
                rate_constant,
                probe_rate,
                easy,
                seed,
            )?),
            Self::Mixed {
                queues,
                weights,
                snapshot,
            } => {
                let subs = queues
                    .iter()
                    .enumerate()
                    .map(|(i, sub)| {
                        let sub_seed = seed.map(|s| s.wrapping_add(i as u64 + 1));
                        Ok(SubQueue {
                            queue: sub.queue.adaptive(continuum(&sub.conditions), sub_seed)?,
                            conditions: sub.conditions.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Box::new(MixedAdaptiveQueue::open(
                    subs,
                    weights.clone(),
                    seed,
                    Box::new(FileSnapshotStore::new(snapshot.clone())),
                )?)
            }
        })
    }

    fn validate(&self, block: usize, conditions: &[ConditionConfig]) -> Result<(), ConfigError> {
        let field = |name: &str| format!("blocks[{block}].queue.{name}");
        let n = conditions.len();
        let needed = self.arity(n);
        if n < needed {
            return Err(ConfigError::invalid(
                field(self.kind()),
                format!("needs {needed} conditions, block has {n}"),
            ));
        }
        match self {
            Self::Kaernbach { params } => params.validate()?,
            Self::DoubleStaircase { .. } | Self::DoubleStaircaseReinforced { .. } => {
                same_continuum(&field(self.kind()), conditions, &[0, 1])?
            }
            Self::Mixed { queues, .. } => {
                if queues.is_empty() {
                    return Err(ConfigError::invalid(field("mixed"), "no sub-queues"));
                }
                for (i, sub) in queues.iter().enumerate() {
                    let sub_field = field(&format!("mixed.queues[{i}]"));
                    if matches!(sub.queue, Self::Random { .. } | Self::Block { .. } | Self::Mixed { .. }) {
                        return Err(ConfigError::invalid(sub_field, "not an adaptive queue"));
                    }
                    let arity = sub.queue.arity(n);
                    let mapping: Vec<usize> = if sub.conditions.is_empty() {
                        (0..arity).collect()
                    } else {
                        sub.conditions.clone()
                    };
                    if mapping.len() != arity {
                        return Err(ConfigError::invalid(
                            sub_field,
                            format!("maps {} conditions, queue selects {arity}", mapping.len()),
                        ));
                    }
                    if let Some(&bad) = mapping.iter().find(|&&c| c >= n) {
                        return Err(ConfigError::invalid(
                            sub_field,
                            format!("condition {bad} out of range"),
                        ));
                    }
                    if let Self::Kaernbach { params } = &sub.queue {
                        params.validate()?;
                    } else {
                        same_continuum(&sub_field, conditions, &mapping)?;
                    }
                }
            }
            Self::Random { .. } | Self::Block { .. } => {}
        }
        Ok(())
    }
}

fn same_continuum(
    field: &str,
    conditions: &[ConditionConfig],
    mapping: &[usize],
) -> Result<(), ConfigError> {
    let lens: Vec<usize> = mapping.iter().map(|&c| conditions[c].stimuli.len()).collect();
    if lens.windows(2).any(|w| w[0] != w[1]) {
        return Err(ConfigError::invalid(
            field,
            format!("staircase conditions must share one continuum, got lengths {lens:?}"),
        ));
    }
    if lens.first().is_some_and(|&len| len < 2) {
        return Err(ConfigError::invalid(field, "continuum needs at least 2 stimuli"));
    }
    Ok(())
}

/// Builds fresh blocks from one [`BlockConfig`]. Every build draws a new
/// seed so repeated passes differ while staying reproducible.
pub struct ConfigBlockFactory {
    config: BlockConfig,
    seed: Option<u64>,
    builds: u64,
}

impl ConfigBlockFactory {
    pub fn new(config: BlockConfig, seed: Option<u64>) -> Self {
        Self {
            config,
            seed,
            builds: 0,
        }
    }
}

impl BlockFactory for ConfigBlockFactory {
    fn build(&mut self) -> Result<Block, Error> {
        let seed = self
            .seed
            .map(|s| s.wrapping_add(self.builds.wrapping_mul(0x1000_0000_01B3)));
        self.builds += 1;
        let conditions = self
            .config
            .conditions
            .iter()
            .enumerate()
            .map(|(i, c)| c.build(seed.map(|s| s ^ (i as u64 + 1))))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let queue = self.config.queue.build(&conditions, seed)?;
        let reinforcement = self.config.reinforcement.build(seed.map(|s| !s));
        Ok(Block::new(conditions, queue, reinforcement)?)
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.trim().is_empty() {
            return Err(ConfigError::invalid("subject", "must not be empty"));
        }
        if self.blocks.is_empty() {
            return Err(ConfigError::invalid("blocks", "at least one block"));
        }
        if self.panel.ports.is_empty() {
            return Err(ConfigError::invalid("panel.ports", "at least one response port"));
        }
        for (b, block) in self.blocks.iter().enumerate() {
            if block.conditions.is_empty() {
                return Err(ConfigError::invalid(
                    format!("blocks[{b}].conditions"),
                    "at least one condition",
                ));
            }
            for c in &block.conditions {
                if c.stimuli.is_empty() {
                    return Err(ConfigError::invalid(
                        format!("blocks[{b}].conditions.{}", c.name),
                        "no stimuli",
                    ));
                }
                if !self.panel.ports.iter().any(|p| p.class == c.desired()) {
                    return Err(ConfigError::invalid(
                        format!("blocks[{b}].conditions.{}", c.name),
                        format!("no response port for class {:?}", c.desired()),
                    ));
                }
            }
            block.queue.validate(b, &block.conditions)?;
            block.reinforcement.validate()?;
        }
        seconds("panel.hopper_max_lag_s", self.panel.hopper_max_lag_s)?;
        seconds("panel.reward_s", self.panel.reward_s)?;
        seconds("panel.punish_s", self.panel.punish_s)?;
        seconds("response_window_s", self.response_window_s)?;
        seconds("intertrial_min_s", self.intertrial_min_s)?;
        seconds("recover_wait_s", self.recover_wait_s)?;
        if seconds("poll_interval_s", self.poll_interval_s)?.is_zero() {
            return Err(ConfigError::invalid("poll_interval_s", "must be positive"));
        }
        if let Some(w) = &self.session.windows {
            w.to_windows()?;
        }
        if let Some(w) = &self.sleep {
            w.to_windows()?;
        }
        Ok(())
    }

    pub fn block_factories(&self) -> Vec<Box<dyn BlockFactory>> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| -> Box<dyn BlockFactory> {
                let seed = self.seed.map(|s| s.wrapping_add((i as u64) << 32));
                Box::new(ConfigBlockFactory::new(b.clone(), seed))
            })
            .collect()
    }

    pub fn session_schedulers(&self) -> Result<StateSchedulers, ConfigError> {
        let mut s = StateSchedulers::default();
        if let Some(w) = &self.session.windows {
            s.push(TimeOfDayScheduler::new(w.to_windows()?));
        }
        let minutes = |m: Option<f64>, field: &str| m.map(|m| seconds(field, m * 60.0)).transpose();
        let duration = minutes(self.session.duration_min, "session.duration_min")?;
        let interval = minutes(self.session.interval_min, "session.interval_min")?;
        if duration.is_some() || interval.is_some() {
            s.push(TimeScheduler::new(duration, interval));
        }
        if let Some(max) = self.session.max_trials {
            s.push(CountScheduler::new(max));
        }
        Ok(s)
    }

    pub fn sleep_schedulers(&self) -> Result<StateSchedulers, ConfigError> {
        let mut s = StateSchedulers::default();
        if let Some(w) = &self.sleep {
            s.push(TimeOfDayScheduler::new(w.to_windows()?));
        }
        Ok(s)
    }

    pub fn experiment_options(&self) -> ExperimentOptions {
        ExperimentOptions {
            poll_interval: Duration::from_secs_f64(self.poll_interval_s),
            recover_wait: Duration::from_secs_f64(self.recover_wait_s),
            hardware_fault_limit: self.hardware_fault_limit,
            num_sessions: self.num_sessions,
            trial: TrialOptions {
                response_window: Duration::from_secs_f64(self.response_window_s),
                intertrial_min: Duration::from_secs_f64(self.intertrial_min_s),
                correction: self.correction,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> serde_json::Value {
        json!({
            "subject": "B1042",
            "seed": 7,
            "blocks": [{
                "conditions": [
                    {"name": "left", "stimuli": [{"name": "a.wav", "duration_s": 1.0}]},
                    {"name": "right", "stimuli": [{"name": "b.wav", "duration_s": 1.0}]}
                ],
                "queue": {"kind": "random", "weights": [2, 1]},
                "reinforcement": {"kind": "fixed_ratio", "ratio": 2}
            }],
            "session": {"windows": {"kind": "periods", "periods": [["07:00", "19:00"]]}, "max_trials": 100},
            "sleep": {"kind": "night", "latitude": 32.88, "longitude": -117.23}
        })
    }

    fn continuum(name: &str, n: usize) -> serde_json::Value {
        let stimuli: Vec<_> = (0..n)
            .map(|i| json!({"name": format!("morph{i:02}.wav"), "duration_s": 0.5}))
            .collect();
        json!({"name": name, "stimuli": stimuli})
    }

    #[test]
    fn parses_with_defaults() {
        let config = ExperimentConfig::from_json(&base().to_string()).unwrap();
        assert_eq!(config.response_window_s, 2.0);
        assert_eq!(config.correction, CorrectionPolicy::Incorrect);
        assert_eq!(config.hardware_fault_limit, 10);
        assert!(!config.session_schedulers().unwrap().is_empty());
        assert!(!config.sleep_schedulers().unwrap().is_empty());
        let opts = config.experiment_options();
        assert_eq!(opts.trial.response_window, Duration::from_secs(2));
    }

    #[test]
    fn factories_build_working_blocks() {
        let config = ExperimentConfig::from_json(&base().to_string()).unwrap();
        let mut factories = config.block_factories();
        let mut block = factories[0].build().unwrap();
        let drawn = block.draw().unwrap().unwrap();
        assert!(["left", "right"].contains(&drawn.contract.name.as_str()));
        assert_eq!(drawn.stimulus.label.as_deref(), Some(drawn.contract.desired.as_str()));
        block.complete(true, false).unwrap();
    }

    #[test]
    fn unknown_response_class_is_rejected() {
        let mut v = base();
        v["blocks"][0]["conditions"][0]["desired"] = json!("up");
        let err = ExperimentConfig::from_json(&v.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[test]
    fn panel_durations_must_be_valid() {
        let layout = serde_json::to_value(PanelLayout::default()).unwrap();
        for field in ["hopper_max_lag_s", "reward_s", "punish_s"] {
            let mut v = base();
            v["panel"] = layout.clone();
            v["panel"][field] = json!(-1.0);
            let err = ExperimentConfig::from_json(&v.to_string()).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
        let mut v = base();
        v["panel"] = layout;
        v["panel"]["reward_s"] = json!(3.5);
        v["panel"]["punish_s"] = json!(0.0);
        let config = ExperimentConfig::from_json(&v.to_string()).unwrap();
        assert_eq!(config.panel.reward_s, 3.5);
    }

    #[test]
    fn oversized_ratio_is_rejected() {
        let mut v = base();
        v["blocks"][0]["reinforcement"] = json!({"kind": "variable_ratio", "ratio": u32::MAX});
        assert!(matches!(
            ExperimentConfig::from_json(&v.to_string()),
            Err(ConfigError::Invalid { .. })
        ));
        v["blocks"][0]["reinforcement"]["ratio"] = json!(MAX_RATIO);
        assert!(ExperimentConfig::from_json(&v.to_string()).is_ok());
    }

    #[test]
    fn bad_time_window_is_rejected() {
        let mut v = base();
        v["session"]["windows"]["periods"][0][1] = json!("7pm");
        assert!(matches!(
            ExperimentConfig::from_json(&v.to_string()),
            Err(ConfigError::TimeOfDay(_))
        ));
    }

    #[test]
    fn staircase_conditions_must_share_a_continuum() {
        let mut v = base();
        v["blocks"][0]["conditions"] = json!([continuum("left", 10), continuum("right", 8)]);
        v["blocks"][0]["queue"] = json!({"kind": "double_staircase"});
        assert!(ExperimentConfig::from_json(&v.to_string()).is_err());

        v["blocks"][0]["conditions"][1] = continuum("right", 10);
        assert!(ExperimentConfig::from_json(&v.to_string()).is_ok());
    }

    #[test]
    fn mixed_queue_persists_to_its_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let snap = dir.path().join("queue.snap");
        let mut v = base();
        v["blocks"][0]["conditions"] = json!([continuum("left", 12), continuum("right", 12)]);
        v["blocks"][0]["queue"] = json!({
            "kind": "mixed",
            "snapshot": snap,
            "queues": [
                {"queue": {"kind": "double_staircase", "rate_constant": 0.1}},
                {"queue": {"kind": "double_staircase_reinforced",
                           "easy": {"kind": "log_biased", "shape": 4.0}}}
            ]
        });
        let config = ExperimentConfig::from_json(&v.to_string()).unwrap();
        let mut block = config.block_factories().remove(0).build().unwrap();
        assert!(snap.exists());
        for _ in 0..5 {
            block.draw().unwrap().unwrap();
            block.complete(true, false).unwrap();
        }

        let mut again = config.block_factories().remove(0).build().unwrap();
        assert!(again.draw().unwrap().is_some());
    }

    #[test]
    fn non_adaptive_sub_queue_is_rejected() {
        let mut v = base();
        v["blocks"][0]["queue"] = json!({
            "kind": "mixed",
            "snapshot": "/tmp/unused.snap",
            "queues": [{"queue": {"kind": "random"}}]
        });
        assert!(ExperimentConfig::from_json(&v.to_string()).is_err());
    }
}
