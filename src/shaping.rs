//! Shaping: teaching a naive subject to work the panel one stage at a time.
//!
//! Every stage runs on the ordinary trial machine. A trial ends with the peck
//! the stage asks for (scored against the trial's desired class and fed
//! through the reinforcement schedule) or with no response. A stage moves on
//! after enough scored pecks and falls back one stage when the subject goes
//! a long time without responding at all.
//!
//! 1. [`ShapingStage::Autoshape`]: food on a variable interval, each feed
//!    announced by the center key flashing. A peck on it feeds at once and
//!    ends the stage.
//! 2. [`ShapingStage::CenterPeck`]: the center key flashes until pecked.
//! 3. [`ShapingStage::CenterThenPort`]: flashing center key, then the trial's
//!    response key flashes until pecked.
//! 4. [`ShapingStage::SteadyCenterThenPort`]: as above with a steady center
//!    key.
//! 5. [`ShapingStage::Task`]: the plain choice task.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::behavior::{Behavior, ChoiceBehavior};
use crate::clock::{wait, Duration};
use crate::error::Error;
use crate::reinforcement::seeded_rng;
use crate::trial::TrialCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapingStage {
    #[default]
    Autoshape,
    CenterPeck,
    CenterThenPort,
    SteadyCenterThenPort,
    Task,
}

impl ShapingStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Autoshape => "autoshape",
            Self::CenterPeck => "center_peck",
            Self::CenterThenPort => "center_then_port",
            Self::SteadyCenterThenPort => "steady_center_then_port",
            Self::Task => "task",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Autoshape => Self::CenterPeck,
            Self::CenterPeck => Self::CenterThenPort,
            Self::CenterThenPort => Self::SteadyCenterThenPort,
            Self::SteadyCenterThenPort | Self::Task => Self::Task,
        }
    }

    pub fn previous(self) -> Self {
        match self {
            Self::Autoshape | Self::CenterPeck => Self::Autoshape,
            Self::CenterThenPort => Self::CenterPeck,
            Self::SteadyCenterThenPort => Self::CenterThenPort,
            Self::Task => Self::Task,
        }
    }

    /// Hopper time for a fed peck. `None` leaves it to the condition.
    pub fn feed(self) -> Option<Duration> {
        match self {
            Self::Autoshape => Some(Duration::from_secs(5)),
            Self::CenterPeck => Some(Duration::from_secs(4)),
            Self::CenterThenPort => Some(Duration::from_secs(3)),
            Self::SteadyCenterThenPort => Some(Duration::from_millis(2500)),
            Self::Task => None,
        }
    }

    /// Whether the trial asks for the center key itself.
    fn wants_center(self) -> bool {
        matches!(self, Self::Autoshape | Self::CenterPeck)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapingOptions {
    /// Response class of the key that starts a trial.
    pub center: String,
    pub start: ShapingStage,
    /// Scored pecks needed to leave each stage after autoshaping.
    pub trials_per_stage: u32,
    /// A stage with no peck at all for this long falls back one stage.
    pub revert_after: Duration,
    /// Bounds of the autoshaping feed interval.
    pub autoshape_interval: (Duration, Duration),
    /// How long the center key flashes ahead of an autoshaping feed.
    pub autoshape_flash: Duration,
    /// Cues are offered in windows of this length until pecked.
    pub cue_window: Duration,
    /// Time between toggles of a flashing key.
    pub flash_interval: Duration,
    pub seed: Option<u64>,
}

impl Default for ShapingOptions {
    fn default() -> Self {
        Self {
            center: "center".into(),
            start: ShapingStage::Autoshape,
            trials_per_stage: 100,
            revert_after: Duration::from_secs(3 * 60 * 60),
            autoshape_interval: (Duration::from_secs(10), Duration::from_secs(40)),
            autoshape_flash: Duration::from_secs(5),
            cue_window: Duration::from_secs(10),
            flash_interval: Duration::from_millis(500),
            seed: None,
        }
    }
}

pub struct ShapingBehavior {
    options: ShapingOptions,
    stage: ShapingStage,
    /// Stage the current trial started in.
    trial_stage: ShapingStage,
    /// Monotonic time the stage began; set by its first trial.
    stage_started: Option<Duration>,
    /// Scored pecks in the current stage.
    scored: u32,
    rng: StdRng,
}

impl std::fmt::Debug for ShapingBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapingBehavior")
            .field("stage", &self.stage)
            .field("scored", &self.scored)
            .finish_non_exhaustive()
    }
}

impl ShapingBehavior {
    pub fn new(options: ShapingOptions) -> Self {
        Self {
            stage: options.start,
            trial_stage: options.start,
            stage_started: None,
            scored: 0,
            rng: seeded_rng(options.seed),
            options,
        }
    }

    pub fn stage(&self) -> ShapingStage {
        self.stage
    }

    pub fn scored(&self) -> u32 {
        self.scored
    }

    fn enter(&mut self, stage: ShapingStage, now: Duration) {
        info!(from = self.stage.as_str(), to = stage.as_str(), "shaping stage");
        self.stage = stage;
        self.stage_started = Some(now);
        self.scored = 0;
    }

    fn stalled(&self, now: Duration) -> bool {
        !matches!(self.stage, ShapingStage::Autoshape | ShapingStage::Task)
            && self.scored == 0
            && self
                .stage_started
                .is_some_and(|t| now.saturating_sub(t) >= self.options.revert_after)
    }

    /// Offer `class` window after window until it is pecked. Gives up when
    /// the session closes, and falls back a stage once the stage stalls.
    fn cue_until_peck(
        &mut self,
        ctx: &mut TrialCtx<'_>,
        class: &str,
        flash: bool,
    ) -> Result<Option<Duration>, Error> {
        let rig = ctx.rig;
        let flash = flash.then_some(self.options.flash_interval);
        loop {
            if let Some(at) = ctx.panel.cue_port(class, self.options.cue_window, flash)? {
                return Ok(Some(at));
            }
            if rig.cancel.is_cancelled() || !ctx.schedulers.is_active(rig.clock.as_ref()) {
                return Ok(None);
            }
            let now = rig.clock.now();
            if self.stalled(now) {
                info!(stage = self.stage.as_str(), "no pecks, falling back");
                self.enter(self.stage.previous(), now);
                return Ok(None);
            }
        }
    }

    fn autoshape(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        let rig = ctx.rig;
        let (lo, hi) = self.options.autoshape_interval;
        let interval = if hi > lo {
            Duration::from_secs_f64(self.rng.gen_range(lo.as_secs_f64()..hi.as_secs_f64()))
        } else {
            lo
        };
        if !wait(rig.clock.as_ref(), interval, &rig.cancel)
            || !ctx.schedulers.is_active(rig.clock.as_ref())
        {
            return Ok(());
        }
        let center = self.options.center.clone();
        let flash = Some(self.options.flash_interval);
        if let Some(at) = ctx.panel.cue_port(&center, self.options.autoshape_flash, flash)? {
            ctx.record_response(center, at);
        }
        Ok(())
    }
}

impl Behavior for ShapingBehavior {
    fn trial_pre(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        if self.stage_started.is_none() {
            self.stage_started = Some(ctx.rig.clock.now());
        }
        self.trial_stage = self.stage;
        ctx.trial
            .annotations
            .insert("shaping_stage".into(), json!(self.stage.as_str()));
        if self.stage.wants_center() {
            ctx.trial.condition.desired = self.options.center.clone();
        }
        Ok(())
    }

    fn stimulus_pre(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        match self.stage {
            ShapingStage::Task => ChoiceBehavior.stimulus_pre(ctx),
            _ => Ok(()),
        }
    }

    fn stimulus_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        match self.stage {
            ShapingStage::Task => ChoiceBehavior.stimulus_main(ctx),
            _ => Ok(()),
        }
    }

    fn response_pre(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        match self.stage {
            ShapingStage::Task => ChoiceBehavior.response_pre(ctx),
            _ => Ok(()),
        }
    }

    fn response_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        let center = self.options.center.clone();
        match self.stage {
            ShapingStage::Autoshape => self.autoshape(ctx),
            ShapingStage::CenterPeck => {
                if let Some(at) = self.cue_until_peck(ctx, &center, true)? {
                    ctx.record_response(center, at);
                }
                Ok(())
            }
            stage @ (ShapingStage::CenterThenPort | ShapingStage::SteadyCenterThenPort) => {
                let flash = stage == ShapingStage::CenterThenPort;
                if self.cue_until_peck(ctx, &center, flash)?.is_none() {
                    return Ok(());
                }
                ctx.mark(&center);
                let target = ctx.trial.condition.desired.clone();
                if let Some(at) = self.cue_until_peck(ctx, &target, true)? {
                    ctx.record_response(target, at);
                }
                Ok(())
            }
            ShapingStage::Task => ChoiceBehavior.response_main(ctx),
        }
    }

    /// Autoshaping feeds whether or not the center key was pecked.
    fn consequence_pre(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        if self.trial_stage == ShapingStage::Autoshape && ctx.trial.response.is_none() {
            ctx.free_reward(self.trial_stage.feed())?;
        }
        Ok(())
    }

    fn reward_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.mark("reward");
        let value = self.trial_stage.feed().or(ctx.trial.condition.reward_value);
        ctx.panel.reward(value)?;
        Ok(())
    }

    fn trial_post(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        if self.stage == ShapingStage::Task || !ctx.trial.correct {
            return Ok(());
        }
        self.scored += 1;
        if self.stage == ShapingStage::Autoshape || self.scored >= self.options.trials_per_stage {
            self.enter(self.stage.next(), ctx.rig.clock.now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{CancelToken, Clock, ManualClock};
    use crate::components::Rig;
    use crate::conditions::Stimulus;
    use crate::events::EventBus;
    use crate::machine::{Outcome, Signal};
    use crate::panel::{PanelLayout, StandardPanel};
    use crate::reinforcement::ContinuousSchedule;
    use crate::schedulers::{Scheduler, StateSchedulers};
    use crate::sim::SimInterface;
    use crate::store::MemoryStore;
    use crate::summary::Summary;
    use crate::trial::tests::contract;
    use crate::trial::{Reinforcement, Response, Trial, TrialOptions, TrialRun, TrialType};

    const LEFT_IR: u32 = 10;
    const CENTER_IR: u32 = 11;
    const RIGHT_IR: u32 = 12;

    struct Chamber {
        clock: ManualClock,
        sim: Arc<SimInterface>,
        panel: StandardPanel,
        rig: Rig,
        schedulers: StateSchedulers,
        store: MemoryStore,
        summary: Summary,
        options: TrialOptions,
    }

    impl Chamber {
        fn new() -> Self {
            let clock = ManualClock::new();
            let sim = Arc::new(SimInterface::new(Arc::new(clock.clone())));
            let layout = PanelLayout::default();
            sim.link(layout.hopper_solenoid, 2);
            let rig = Rig::new(Arc::new(clock.clone()), CancelToken::new(), EventBus::default());
            let panel = StandardPanel::new(sim.clone(), &layout, rig.clone());
            Self {
                clock,
                sim,
                panel,
                rig,
                schedulers: StateSchedulers::default(),
                store: MemoryStore::new(),
                summary: Summary::new(),
                options: TrialOptions::default(),
            }
        }

        /// Press `channel` this long after now.
        fn press_in(&self, channel: u32, after: Duration) {
            let at = self.clock.now() + after;
            self.sim.press(channel, at, Duration::from_millis(50));
        }

        fn run(&mut self, behavior: &mut ShapingBehavior, desired: &str) -> (Outcome, Trial) {
            let trial = Trial::new(
                0,
                0,
                0,
                TrialType::Normal,
                contract(desired),
                Stimulus::new(format!("{desired}.wav"), Duration::from_millis(500)),
            );
            let mut schedule = ContinuousSchedule;
            let mut store = self.store.clone();
            let ctx = TrialCtx::new(
                trial,
                &mut self.panel,
                &self.rig,
                &mut schedule,
                &mut self.schedulers,
                &mut store,
                &mut self.summary,
                &self.options,
            );
            let mut run = TrialRun::new(behavior, ctx);
            let outcome = run.run().unwrap();
            (outcome, run.into_trial())
        }
    }

    fn shaping(start: ShapingStage) -> ShapingBehavior {
        ShapingBehavior::new(ShapingOptions {
            start,
            trials_per_stage: 2,
            revert_after: Duration::from_secs(60),
            autoshape_interval: (Duration::from_secs(10), Duration::from_secs(10)),
            seed: Some(3),
            ..ShapingOptions::default()
        })
    }

    #[test]
    fn autoshape_peck_moves_on_to_center_pecking() {
        let mut chamber = Chamber::new();
        let mut behavior = shaping(ShapingStage::Autoshape);
        chamber.press_in(CENTER_IR, Duration::from_secs(12));
        let (outcome, trial) = chamber.run(&mut behavior, "left");

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(trial.response, Response::Class("center".into()));
        assert_eq!(trial.condition.desired, "center");
        assert!(trial.correct);
        assert_eq!(trial.reward, Reinforcement::Delivered);
        assert_eq!(chamber.store.records()[0]["shaping_stage"], "autoshape");
        assert_eq!(behavior.stage(), ShapingStage::CenterPeck);
        assert_eq!(behavior.scored(), 0);
    }

    #[test]
    fn autoshape_feeds_without_a_peck() {
        let mut chamber = Chamber::new();
        let mut behavior = shaping(ShapingStage::Autoshape);
        let (_, trial) = chamber.run(&mut behavior, "left");

        assert_eq!(trial.response, Response::None);
        assert!(!trial.correct);
        assert_eq!(trial.reward, Reinforcement::Delivered);
        assert_eq!(chamber.summary.feeds, 1);
        // Interval, flash and a five second feed.
        assert!(chamber.clock.now() >= Duration::from_secs(20));
        assert_eq!(behavior.stage(), ShapingStage::Autoshape);
    }

    #[test]
    fn response_port_stage_advances_after_enough_pecks() {
        let mut chamber = Chamber::new();
        let mut behavior = shaping(ShapingStage::CenterThenPort);

        chamber.press_in(CENTER_IR, Duration::from_secs(1));
        chamber.press_in(RIGHT_IR, Duration::from_secs(2));
        chamber.press_in(LEFT_IR, Duration::from_secs(3));
        let (_, trial) = chamber.run(&mut behavior, "left");
        assert_eq!(trial.response, Response::Class("left".into()));
        assert!(trial.correct);
        assert!(trial.events.iter().any(|e| e.name == "center"));
        assert_eq!(behavior.stage(), ShapingStage::CenterThenPort);
        assert_eq!(behavior.scored(), 1);

        chamber.press_in(CENTER_IR, Duration::from_secs(1));
        chamber.press_in(RIGHT_IR, Duration::from_secs(4));
        let (_, trial) = chamber.run(&mut behavior, "right");
        assert!(trial.correct);
        assert_eq!(behavior.stage(), ShapingStage::SteadyCenterThenPort);
        assert_eq!(behavior.scored(), 0);
        assert_eq!(chamber.summary.feeds, 2);
    }

    #[test]
    fn silent_stage_falls_back() {
        let mut chamber = Chamber::new();
        let mut behavior = shaping(ShapingStage::CenterPeck);
        let (outcome, trial) = chamber.run(&mut behavior, "left");

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(trial.response, Response::None);
        assert_eq!(trial.reward, Reinforcement::Withheld);
        assert!(chamber.clock.now() >= Duration::from_secs(60));
        assert_eq!(behavior.stage(), ShapingStage::Autoshape);
    }

    /// Active until the clock passes a fixed time.
    struct Until(Duration);
    impl Scheduler for Until {
        fn name(&self) -> &'static str {
            "until"
        }
        fn check(&self, clock: &dyn Clock) -> bool {
            clock.now() < self.0
        }
    }

    #[test]
    fn closing_session_abandons_the_cue() {
        let mut chamber = Chamber::new();
        chamber.schedulers.push(Until(Duration::from_secs(25)));
        let mut behavior = shaping(ShapingStage::CenterPeck);
        let (outcome, _) = chamber.run(&mut behavior, "left");

        assert_eq!(outcome, Outcome::Signalled(Signal::EndSession));
        assert!(chamber.store.records().is_empty());
        assert!(chamber.clock.now() < Duration::from_secs(60));
        assert_eq!(behavior.stage(), ShapingStage::CenterPeck);
    }

    #[test]
    fn last_stage_graduates_to_the_task() {
        let mut chamber = Chamber::new();
        let mut behavior = ShapingBehavior::new(ShapingOptions {
            start: ShapingStage::SteadyCenterThenPort,
            trials_per_stage: 1,
            ..ShapingOptions::default()
        });
        chamber.press_in(CENTER_IR, Duration::from_secs(1));
        chamber.press_in(LEFT_IR, Duration::from_secs(2));
        chamber.run(&mut behavior, "left");
        assert_eq!(behavior.stage(), ShapingStage::Task);

        chamber.press_in(RIGHT_IR, Duration::from_millis(300));
        let (_, trial) = chamber.run(&mut behavior, "right");
        assert!(trial.onset.is_some());
        assert_eq!(trial.response, Response::Class("right".into()));
        assert_eq!(trial.condition.desired, "right");
        assert_eq!(behavior.stage(), ShapingStage::Task);
    }
}
