//! Trial-condition generators.
//!
//! Every queue yields [`Selection`]s naming a condition of the owning block.
//! Stateful queues must see exactly one `update` after each `next`; calling
//! either out of turn is a [`UsageError`] raised on the spot.

use hashbrown::HashMap;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ConfigError, Error, SnapshotError, UsageError};
use crate::reinforcement::seeded_rng;
use crate::snapshot::{MixedSnapshot, SnapshotStore};

pub type Annotations = HashMap<String, Value>;

/// One draw from a queue.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    /// Index into the block's condition list.
    pub condition: usize,
    /// Stimulus index within the condition, for queues that address a
    /// continuum directly. `None` lets the condition sample.
    pub item: Option<usize>,
    /// Scalar staircase level, if any.
    pub level: Option<f64>,
    pub annotations: Annotations,
}

impl Selection {
    pub fn condition(condition: usize) -> Self {
        Self {
            condition,
            ..Self::default()
        }
    }

    pub fn with_item(mut self, item: usize) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_level(mut self, level: f64) -> Self {
        self.level = Some(level);
        self
    }

    pub fn annotate(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.annotations.insert(key.to_owned(), value.into());
        self
    }
}

pub trait Queue: Send {
    fn name(&self) -> &str;

    /// `Ok(None)` once the queue is exhausted.
    fn next(&mut self) -> Result<Option<Selection>, Error>;

    fn update(&mut self, correct: bool, no_response: bool) -> Result<(), Error>;
}

/// Enforces strict `next`/`update` alternation.
#[derive(Debug, Clone, Default)]
struct Alternation {
    awaiting_update: bool,
}

impl Alternation {
    fn check_next(&self, queue: &str) -> Result<(), UsageError> {
        if self.awaiting_update {
            return Err(UsageError::NotUpdated {
                queue: queue.to_owned(),
            });
        }
        Ok(())
    }

    fn issued(&mut self) {
        self.awaiting_update = true;
    }

    fn take_update(&mut self, queue: &str) -> Result<(), UsageError> {
        if !self.awaiting_update {
            return Err(UsageError::UpdateWithoutNext {
                queue: queue.to_owned(),
            });
        }
        self.awaiting_update = false;
        Ok(())
    }
}

/// Uniform or weighted draws, up to `max_items`.
pub struct RandomQueue {
    pool: Vec<usize>,
    max_items: Option<usize>,
    drawn: usize,
    rng: StdRng,
}

impl RandomQueue {
    /// `weights` are integer repeat counts per condition.
    pub fn new(
        n_conditions: usize,
        weights: Option<&[u32]>,
        max_items: Option<usize>,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if n_conditions == 0 {
            return Err(ConfigError::invalid("queue.random", "no conditions"));
        }
        let pool: Vec<usize> = match weights {
            None => (0..n_conditions).collect(),
            Some(w) if w.len() != n_conditions => {
                return Err(ConfigError::invalid(
                    "queue.random.weights",
                    format!("{} weights for {} conditions", w.len(), n_conditions),
                ))
            }
            Some(w) => w
                .iter()
                .enumerate()
                .flat_map(|(i, &count)| std::iter::repeat(i).take(count as usize))
                .collect(),
        };
        if pool.is_empty() {
            return Err(ConfigError::invalid("queue.random.weights", "all weights are zero"));
        }
        Ok(Self {
            pool,
            max_items,
            drawn: 0,
            rng: seeded_rng(seed),
        })
    }
}

impl Queue for RandomQueue {
    fn name(&self) -> &str {
        "random"
    }

    fn next(&mut self) -> Result<Option<Selection>, Error> {
        if self.max_items.is_some_and(|max| self.drawn >= max) {
            return Ok(None);
        }
        self.drawn += 1;
        Ok(self
            .pool
            .choose(&mut self.rng)
            .map(|&condition| Selection::condition(condition)))
    }

    fn update(&mut self, _correct: bool, _no_response: bool) -> Result<(), Error> {
        Ok(())
    }
}

/// The condition list repeated `reps` times, optionally shuffled once.
pub struct BlockQueue {
    order: Vec<usize>,
    pos: usize,
}

impl BlockQueue {
    pub fn new(n_conditions: usize, reps: usize, shuffle: bool, seed: Option<u64>) -> Self {
        let mut order: Vec<usize> = (0..reps).flat_map(|_| 0..n_conditions).collect();
        if shuffle {
            order.shuffle(&mut seeded_rng(seed));
        }
        Self { order, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.order.len() - self.pos
    }
}

impl Queue for BlockQueue {
    fn name(&self) -> &str {
        "block"
    }

    fn next(&mut self) -> Result<Option<Selection>, Error> {
        let Some(&condition) = self.order.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        Ok(Some(Selection::condition(condition)))
    }

    fn update(&mut self, _correct: bool, _no_response: bool) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Trials,
    Reversals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KaernbachParams {
    #[serde(default = "default_start")]
    pub start: f64,
    #[serde(default = "default_stepsize_up")]
    pub stepsize_up: f64,
    #[serde(default = "default_stepsize_dn")]
    pub stepsize_dn: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default = "default_start")]
    pub max: f64,
    #[serde(default = "default_crit")]
    pub crit: u32,
    #[serde(default = "default_crit_type")]
    pub crit_type: Criterion,
}

fn default_start() -> f64 {
    100.0
}
fn default_stepsize_up() -> f64 {
    3.0
}
fn default_stepsize_dn() -> f64 {
    1.0
}
fn default_crit() -> u32 {
    100
}
fn default_crit_type() -> Criterion {
    Criterion::Trials
}

impl Default for KaernbachParams {
    fn default() -> Self {
        Self {
            start: default_start(),
            stepsize_up: default_stepsize_up(),
            stepsize_dn: default_stepsize_dn(),
            min: 0.0,
            max: default_start(),
            crit: default_crit(),
            crit_type: default_crit_type(),
        }
    }
}

impl KaernbachParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min <= self.start && self.start <= self.max) {
            return Err(ConfigError::invalid(
                "queue.kaernbach",
                format!("start {} outside [{}, {}]", self.start, self.min, self.max),
            ));
        }
        if self.stepsize_up <= 0.0 || self.stepsize_dn <= 0.0 {
            return Err(ConfigError::invalid("queue.kaernbach", "step sizes must be positive"));
        }
        if self.crit == 0 {
            return Err(ConfigError::invalid("queue.kaernbach.crit", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KaernbachState {
    pub value: f64,
    pub trend: Option<Trend>,
    pub trials: u32,
    pub reversals: u32,
}

/// Weighted up/down staircase over a scalar level. A missing response is
/// scored as incorrect.
pub struct KaernbachStaircase {
    params: KaernbachParams,
    state: KaernbachState,
    guard: Alternation,
}

impl KaernbachStaircase {
    pub fn new(params: KaernbachParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            state: KaernbachState {
                value: params.start,
                trend: None,
                trials: 0,
                reversals: 0,
            },
            params,
            guard: Alternation::default(),
        })
    }

    pub fn state(&self) -> &KaernbachState {
        &self.state
    }

    pub fn is_exhausted(&self) -> bool {
        let count = match self.params.crit_type {
            Criterion::Trials => self.state.trials,
            Criterion::Reversals => self.state.reversals,
        };
        count >= self.params.crit
    }

    fn restore(&mut self, state: KaernbachState) -> Result<(), SnapshotError> {
        let (min, max) = (self.params.min, self.params.max);
        if !(min..=max).contains(&state.value) {
            return Err(SnapshotError::Mismatch(format!(
                "staircase value {} outside [{min}, {max}]",
                state.value
            )));
        }
        self.state = state;
        Ok(())
    }
}

impl Queue for KaernbachStaircase {
    fn name(&self) -> &str {
        "kaernbach"
    }

    fn next(&mut self) -> Result<Option<Selection>, Error> {
        self.guard.check_next(self.name())?;
        if self.is_exhausted() {
            return Ok(None);
        }
        self.guard.issued();
        Ok(Some(Selection::condition(0).with_level(self.state.value)))
    }

    fn update(&mut self, correct: bool, no_response: bool) -> Result<(), Error> {
        self.guard.take_update("kaernbach")?;
        let correct = correct && !no_response;
        let trend = if correct { Trend::Down } else { Trend::Up };
        let state = &mut self.state;

        state.trials += 1;
        if state.trend.is_some_and(|prev| prev != trend) {
            state.reversals += 1;
        }
        state.trend = Some(trend);

        let next = match trend {
            Trend::Down => state.value - self.params.stepsize_dn,
            Trend::Up => state.value + self.params.stepsize_up,
        };
        state.value = next.clamp(self.params.min, self.params.max);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketState {
    pub low_idx: usize,
    pub high_idx: usize,
}

impl BracketState {
    pub fn width(&self) -> usize {
        self.high_idx.saturating_sub(self.low_idx)
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    low: bool,
    value: usize,
}

/// Brackets the category boundary of an ordered continuum of `len` stimuli.
///
/// Low-side probes are presented as condition 0, high-side probes as
/// condition 1; both conditions are expected to hold the same continuum.
pub struct DoubleStaircase {
    rate_constant: f64,
    len: usize,
    bracket: BracketState,
    probe: Option<Probe>,
    guard: Alternation,
    rng: StdRng,
}

impl DoubleStaircase {
    pub fn new(len: usize, rate_constant: f64, seed: Option<u64>) -> Result<Self, ConfigError> {
        if len < 2 {
            return Err(ConfigError::invalid(
                "queue.double_staircase",
                "continuum needs at least two stimuli",
            ));
        }
        if !(rate_constant > 0.0 && rate_constant <= 1.0) {
            return Err(ConfigError::invalid(
                "queue.double_staircase.rate_constant",
                format!("{rate_constant} not in (0, 1]"),
            ));
        }
        Ok(Self {
            rate_constant,
            len,
            bracket: BracketState {
                low_idx: 0,
                high_idx: len - 1,
            },
            probe: None,
            guard: Alternation::default(),
            rng: seeded_rng(seed),
        })
    }

    pub fn bracket(&self) -> BracketState {
        self.bracket
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_exhausted(&self) -> bool {
        self.bracket.width() <= 1
    }

    fn restore(&mut self, bracket: BracketState) -> Result<(), SnapshotError> {
        if bracket.low_idx > bracket.high_idx || bracket.high_idx >= self.len {
            return Err(SnapshotError::Mismatch(format!(
                "bracket [{}, {}] does not fit a continuum of {}",
                bracket.low_idx, bracket.high_idx, self.len
            )));
        }
        self.bracket = bracket;
        Ok(())
    }
}

impl Queue for DoubleStaircase {
    fn name(&self) -> &str {
        "double_staircase"
    }

    fn next(&mut self) -> Result<Option<Selection>, Error> {
        self.guard.check_next(self.name())?;
        if self.is_exhausted() {
            return Ok(None);
        }
        let width = self.bracket.width();
        let delta = ((width as f64 * self.rate_constant).ceil() as usize).clamp(1, width);
        let low = self.rng.gen_bool(0.5);
        let (condition, value, side) = if low {
            (0, self.bracket.low_idx + delta, "low")
        } else {
            (1, self.bracket.high_idx - delta, "high")
        };
        self.probe = Some(Probe { low, value });
        self.guard.issued();
        Ok(Some(
            Selection::condition(condition)
                .with_item(value)
                .annotate("probe_side", side),
        ))
    }

    fn update(&mut self, correct: bool, _no_response: bool) -> Result<(), Error> {
        self.guard.take_update("double_staircase")?;
        let probe = self.probe.take().ok_or_else(|| UsageError::UpdateWithoutNext {
            queue: "double_staircase".to_owned(),
        })?;
        if correct {
            if probe.low {
                self.bracket.low_idx = probe.value;
            } else {
                self.bracket.high_idx = probe.value;
            }
        }
        Ok(())
    }
}

/// How easy trials outside the bracket are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EasySampling {
    Uniform,
    /// Biased toward the continuum extremes; larger `shape` biases harder.
    LogBiased { shape: f64 },
}

impl EasySampling {
    fn shape(self, u: f64) -> f64 {
        match self {
            Self::Uniform => u,
            Self::LogBiased { shape } => (1.0 + shape * u).ln() / (1.0 + shape).ln(),
        }
    }
}

/// A [`DoubleStaircase`] probed at `probe_rate`, interleaved with easy
/// trials drawn from outside the current bracket.
pub struct DoubleStaircaseReinforced {
    inner: DoubleStaircase,
    probe_rate: f64,
    easy: EasySampling,
    last_probe: bool,
    guard: Alternation,
    rng: StdRng,
}

impl DoubleStaircaseReinforced {
    pub fn new(
        len: usize,
        rate_constant: f64,
        probe_rate: f64,
        easy: EasySampling,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&probe_rate) {
            return Err(ConfigError::invalid(
                "queue.double_staircase_reinforced.probe_rate",
                format!("{probe_rate} not in [0, 1]"),
            ));
        }
        if let EasySampling::LogBiased { shape } = easy {
            if !(shape > 0.0 && shape.is_finite()) {
                return Err(ConfigError::invalid(
                    "queue.double_staircase_reinforced.easy.shape",
                    "must be a positive number",
                ));
            }
        }
        // Derive a distinct stream for the inner staircase.
        let inner_seed = seed.map(|s| s.wrapping_add(0x9E37_79B9_7F4A_7C15));
        Ok(Self {
            inner: DoubleStaircase::new(len, rate_constant, inner_seed)?,
            probe_rate,
            easy,
            last_probe: false,
            guard: Alternation::default(),
            rng: seeded_rng(seed),
        })
    }

    pub fn bracket(&self) -> BracketState {
        self.inner.bracket()
    }

    pub fn probe_rate(&self) -> f64 {
        self.probe_rate
    }

    fn easy_trial(&mut self) -> Selection {
        let BracketState { low_idx, high_idx } = self.inner.bracket;
        let x = self.easy.shape(self.rng.gen::<f64>());
        if self.rng.gen_bool(0.5) {
            let span = low_idx + 1;
            let d = ((x * span as f64) as usize).min(span - 1);
            Selection::condition(0)
                .with_item(low_idx - d)
                .annotate("probe_side", "low")
        } else {
            let span = self.inner.len - high_idx;
            let d = ((x * span as f64) as usize).min(span - 1);
            Selection::condition(1)
                .with_item(high_idx + d)
                .annotate("probe_side", "high")
        }
    }
}

impl Queue for DoubleStaircaseReinforced {
    fn name(&self) -> &str {
        "double_staircase_reinforced"
    }

    fn next(&mut self) -> Result<Option<Selection>, Error> {
        self.guard.check_next(self.name())?;

        if self.probe_rate > 0.0 && self.rng.gen_bool(self.probe_rate) {
            match self.inner.next()? {
                Some(selection) => {
                    self.last_probe = true;
                    self.guard.issued();
                    return Ok(Some(selection.annotate("probe", true)));
                }
                None => {
                    info!("double staircase converged; presenting easy trials only");
                    self.probe_rate = 0.0;
                }
            }
        }

        self.last_probe = false;
        let selection = self.easy_trial().annotate("probe", false);
        self.guard.issued();
        Ok(Some(selection))
    }

    fn update(&mut self, correct: bool, no_response: bool) -> Result<(), Error> {
        self.guard.take_update("double_staircase_reinforced")?;
        if self.last_probe {
            self.last_probe = false;
            self.inner.update(correct, no_response)?;
        }
        Ok(())
    }
}

/// Persisted state of one adaptive sub-queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdaptiveState {
    Kaernbach(KaernbachState),
    DoubleStaircase { bracket: BracketState },
    DoubleStaircaseReinforced { bracket: BracketState, probe_rate: f64 },
}

/// Queues whose state a [`MixedAdaptiveQueue`] can persist.
pub enum AdaptiveQueue {
    Kaernbach(KaernbachStaircase),
    DoubleStaircase(DoubleStaircase),
    DoubleStaircaseReinforced(DoubleStaircaseReinforced),
}

impl AdaptiveQueue {
    fn queue_mut(&mut self) -> &mut dyn Queue {
        match self {
            Self::Kaernbach(q) => q,
            Self::DoubleStaircase(q) => q,
            Self::DoubleStaircaseReinforced(q) => q,
        }
    }

    pub fn state(&self) -> AdaptiveState {
        match self {
            Self::Kaernbach(q) => AdaptiveState::Kaernbach(q.state.clone()),
            Self::DoubleStaircase(q) => AdaptiveState::DoubleStaircase { bracket: q.bracket },
            Self::DoubleStaircaseReinforced(q) => AdaptiveState::DoubleStaircaseReinforced {
                bracket: q.inner.bracket,
                probe_rate: q.probe_rate,
            },
        }
    }

    fn restore(&mut self, state: AdaptiveState) -> Result<(), SnapshotError> {
        match (self, state) {
            (Self::Kaernbach(q), AdaptiveState::Kaernbach(s)) => q.restore(s),
            (Self::DoubleStaircase(q), AdaptiveState::DoubleStaircase { bracket }) => {
                q.restore(bracket)
            }
            (
                Self::DoubleStaircaseReinforced(q),
                AdaptiveState::DoubleStaircaseReinforced {
                    bracket,
                    probe_rate,
                },
            ) => {
                q.inner.restore(bracket)?;
                q.probe_rate = probe_rate.clamp(0.0, 1.0);
                Ok(())
            }
            (q, s) => Err(SnapshotError::Mismatch(format!(
                "configured {} but snapshot holds {:?}",
                q.queue_mut().name(),
                s
            ))),
        }
    }
}

pub struct SubQueue {
    pub queue: AdaptiveQueue,
    /// Block condition index for each condition the sub-queue selects.
    /// Empty means selections map through unchanged.
    pub conditions: Vec<usize>,
}

/// Picks a sub-queue per trial and persists every sub-queue after each
/// update. A snapshot found at construction replaces the fresh state.
pub struct MixedAdaptiveQueue {
    subs: Vec<SubQueue>,
    weights: Vec<f64>,
    exhausted: Vec<bool>,
    active: Option<usize>,
    guard: Alternation,
    rng: StdRng,
    store: Box<dyn SnapshotStore>,
}

impl std::fmt::Debug for MixedAdaptiveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixedAdaptiveQueue")
            .field("sub_queues", &self.subs.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl MixedAdaptiveQueue {
    pub fn open(
        subs: Vec<SubQueue>,
        weights: Option<Vec<f64>>,
        seed: Option<u64>,
        store: Box<dyn SnapshotStore>,
    ) -> Result<Self, Error> {
        if subs.is_empty() {
            return Err(ConfigError::invalid("queue.mixed", "no sub-queues").into());
        }
        let weights = weights.unwrap_or_else(|| vec![1.0; subs.len()]);
        if weights.len() != subs.len() {
            return Err(ConfigError::invalid(
                "queue.mixed.weights",
                format!("{} weights for {} sub-queues", weights.len(), subs.len()),
            )
            .into());
        }
        if weights.iter().any(|w| !(*w >= 0.0 && w.is_finite())) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::invalid(
                "queue.mixed.weights",
                "weights must be non-negative with a positive sum",
            )
            .into());
        }

        let mut queue = Self {
            exhausted: vec![false; subs.len()],
            subs,
            weights,
            active: None,
            guard: Alternation::default(),
            rng: seeded_rng(seed),
            store,
        };
        match queue.store.load()? {
            Some(snapshot) => {
                queue.restore(snapshot)?;
                info!(sub_queues = queue.subs.len(), "restored adaptive queue snapshot");
            }
            None => {
                queue.save()?;
                debug!("wrote fresh adaptive queue snapshot");
            }
        }
        Ok(queue)
    }

    pub fn snapshot(&self) -> MixedSnapshot {
        MixedSnapshot::new(self.subs.iter().map(|s| s.queue.state()).collect())
    }

    pub fn sub_queue_states(&self) -> Vec<AdaptiveState> {
        self.subs.iter().map(|s| s.queue.state()).collect()
    }

    fn restore(&mut self, snapshot: MixedSnapshot) -> Result<(), SnapshotError> {
        snapshot.check_schema()?;
        if snapshot.queues.len() != self.subs.len() {
            return Err(SnapshotError::Mismatch(format!(
                "snapshot has {} sub-queues, {} configured",
                snapshot.queues.len(),
                self.subs.len()
            )));
        }
        for (sub, state) in self.subs.iter_mut().zip(snapshot.queues) {
            sub.queue.restore(state)?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), SnapshotError> {
        self.store.save(&self.snapshot())
    }
}

impl Queue for MixedAdaptiveQueue {
    fn name(&self) -> &str {
        "mixed"
    }

    fn next(&mut self) -> Result<Option<Selection>, Error> {
        self.guard.check_next(self.name())?;
        loop {
            let live: Vec<f64> = self
                .weights
                .iter()
                .zip(&self.exhausted)
                .map(|(&w, &done)| if done { 0.0 } else { w })
                .collect();
            if live.iter().all(|&w| w <= 0.0) {
                return Ok(None);
            }
            let dist = WeightedIndex::new(&live)
                .map_err(|e| UsageError::Invalid(format!("mixed queue weights: {e}")))?;
            let idx = dist.sample(&mut self.rng);

            let sub = &mut self.subs[idx];
            let Some(mut selection) = sub.queue.queue_mut().next()? else {
                debug!(sub_queue = idx, "sub-queue exhausted");
                self.exhausted[idx] = true;
                continue;
            };
            if !sub.conditions.is_empty() {
                selection.condition = sub.conditions.get(selection.condition).copied().ok_or(
                    UsageError::ConditionOutOfRange {
                        index: selection.condition,
                        len: sub.conditions.len(),
                    },
                )?;
            }
            self.active = Some(idx);
            self.guard.issued();
            return Ok(Some(selection.annotate("sub_queue", idx)));
        }
    }

    fn update(&mut self, correct: bool, no_response: bool) -> Result<(), Error> {
        self.guard.take_update("mixed")?;
        let idx = self.active.take().ok_or_else(|| UsageError::UpdateWithoutNext {
            queue: "mixed".to_owned(),
        })?;
        self.subs[idx].queue.queue_mut().update(correct, no_response)?;
        self.save()?;
        Ok(())
    }
}
