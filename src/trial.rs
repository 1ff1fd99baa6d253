//! One stimulus, response and consequence episode.
//!
//! A [`TrialRun`] pairs the experiment's [`Behavior`] hooks with a
//! [`TrialCtx`] and drives them through a nested [`StateMachine`]:
//!
//! `Pre → Stimulus{Pre,Main,Post} → Response{Pre,Main,Post} →
//! Consequence{Pre,Main,Post} → Post`
//!
//! Faults jump to `Abort`, which puts the panel in a safe state and re-raises.
//! Before each of the stimulus, response and consequence phases the session
//! schedulers are consulted; if the session is over the trial is abandoned
//! without being stored.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::behavior::Behavior;
use crate::clock::{wait, Duration};
use crate::components::Rig;
use crate::conditions::{Contract, Stimulus};
use crate::error::{ComponentError, Error, HardwareError, UsageError};
use crate::machine::{Outcome, Signal, StateMachine, Step};
use crate::panel::Panel;
use crate::queues::Annotations;
use crate::reinforcement::ReinforcementSchedule;
use crate::schedulers::StateSchedulers;
use crate::store::{DataStore, Record};
use crate::summary::Summary;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Response {
    #[default]
    None,
    Class(String),
}

impl Response {
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Class(class) => class,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Whether a reward or punishment went out. Faults carry the component tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reinforcement {
    #[default]
    Withheld,
    Delivered,
    Fault(String),
}

impl Reinforcement {
    /// `false`, `true` or `"error:<tag>"`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Withheld => Value::Bool(false),
            Self::Delivered => Value::Bool(true),
            Self::Fault(tag) => Value::String(format!("error:{tag}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrialType {
    #[default]
    Normal,
    Correction,
}

impl TrialType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Correction => "correction",
        }
    }
}

/// Sub-event timestamp, relative to trial start.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialEvent {
    pub at: Duration,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Trial {
    pub index: u64,
    pub session: u32,
    pub block: usize,
    pub time: DateTime<Local>,
    pub trial_type: TrialType,
    pub condition: Contract,
    pub stimulus: Stimulus,
    pub level: Option<f64>,
    pub min_wait: Duration,
    pub max_wait: Duration,
    /// Stimulus onset, relative to trial start.
    pub onset: Option<Duration>,
    pub response: Response,
    pub correct: bool,
    /// Reaction time from stimulus onset.
    pub rt: Option<Duration>,
    pub reward: Reinforcement,
    pub punish: Reinforcement,
    pub duration: Option<Duration>,
    pub events: Vec<TrialEvent>,
    pub annotations: Annotations,
}

impl Trial {
    pub fn new(
        index: u64,
        session: u32,
        block: usize,
        trial_type: TrialType,
        condition: Contract,
        stimulus: Stimulus,
    ) -> Self {
        Self {
            index,
            session,
            block,
            time: Local::now(),
            trial_type,
            condition,
            stimulus,
            level: None,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
            onset: None,
            response: Response::None,
            correct: false,
            rt: None,
            reward: Reinforcement::Withheld,
            punish: Reinforcement::Withheld,
            duration: None,
            events: Vec::new(),
            annotations: Annotations::new(),
        }
    }

    /// Flat record for the data store. Annotations never shadow core fields.
    pub fn to_record(&self) -> Record {
        let secs = |d: Option<Duration>| d.map_or(Value::Null, |d| json!(d.as_secs_f64()));
        let mut record: Record = self
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let core = json!({
            "index": self.index,
            "session": self.session,
            "block": self.block,
            "time": self.time.to_rfc3339(),
            "type": self.trial_type.as_str(),
            "condition": self.condition.name,
            "desired": self.condition.desired,
            "stimulus": self.stimulus.name,
            "stimulus_file": self.stimulus.file.as_ref().map(|p| p.display().to_string()),
            "level": self.level,
            "min_wait": self.min_wait.as_secs_f64(),
            "max_wait": self.max_wait.as_secs_f64(),
            "onset": secs(self.onset),
            "response": self.response.as_str(),
            "correct": self.correct,
            "rt": secs(self.rt),
            "reward": self.reward.to_value(),
            "punish": self.punish.to_value(),
            "duration": secs(self.duration),
            "events": self.events.iter().map(|e| json!({
                "at": e.at.as_secs_f64(),
                "name": e.name,
            })).collect::<Vec<_>>(),
        });
        if let Value::Object(core) = core {
            record.extend(core);
        }
        record
    }
}

/// When the next trial repeats the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionPolicy {
    Off,
    /// After an incorrect answer. An unanswered trial leaves the mode as is.
    #[default]
    Incorrect,
    IncorrectOrNoResponse,
}

impl CorrectionPolicy {
    /// Correction mode after `trial`, given whether it is currently on.
    pub fn after(self, trial: &Trial, active: bool) -> bool {
        if trial.correct {
            return false;
        }
        match self {
            Self::Off => false,
            Self::Incorrect if trial.response.is_none() => active,
            Self::Incorrect | Self::IncorrectOrNoResponse => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialOptions {
    /// Added to the stimulus duration to get the response deadline.
    pub response_window: Duration,
    pub intertrial_min: Duration,
    pub correction: CorrectionPolicy,
}

impl Default for TrialOptions {
    fn default() -> Self {
        Self {
            response_window: Duration::from_secs(2),
            intertrial_min: Duration::ZERO,
            correction: CorrectionPolicy::default(),
        }
    }
}

/// Everything a trial's phases touch. Borrowed from the experiment for the
/// lifetime of one trial.
pub struct TrialCtx<'a> {
    pub trial: Trial,
    pub panel: &'a mut dyn Panel,
    pub rig: &'a Rig,
    pub schedule: &'a mut dyn ReinforcementSchedule,
    pub schedulers: &'a mut StateSchedulers,
    pub store: &'a mut dyn DataStore,
    pub summary: &'a mut Summary,
    pub options: &'a TrialOptions,
    started: Duration,
    correction_next: bool,
    fault: Option<Error>,
}

impl<'a> TrialCtx<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trial: Trial,
        panel: &'a mut dyn Panel,
        rig: &'a Rig,
        schedule: &'a mut dyn ReinforcementSchedule,
        schedulers: &'a mut StateSchedulers,
        store: &'a mut dyn DataStore,
        summary: &'a mut Summary,
        options: &'a TrialOptions,
    ) -> Self {
        Self {
            trial,
            panel,
            rig,
            schedule,
            schedulers,
            store,
            summary,
            options,
            started: Duration::ZERO,
            correction_next: false,
            fault: None,
        }
    }

    /// Time since trial start.
    pub fn elapsed(&self) -> Duration {
        self.rig.clock.now().saturating_sub(self.started)
    }

    /// Monotonic time at which the response window closes.
    pub fn deadline(&self) -> Duration {
        self.started + self.trial.max_wait
    }

    pub fn mark(&mut self, name: &str) {
        let at = self.elapsed();
        self.trial.events.push(TrialEvent {
            at,
            name: name.to_owned(),
        });
    }

    pub fn mark_onset(&mut self) {
        self.trial.onset = Some(self.elapsed());
        self.mark("stimulus_onset");
    }

    /// Record a response seen at monotonic time `at`. Only the first counts.
    pub fn record_response(&mut self, class: String, at: Duration) {
        if !self.trial.response.is_none() {
            return;
        }
        let onset = self.started + self.trial.onset.unwrap_or(Duration::ZERO);
        self.trial.rt = Some(at.saturating_sub(onset));
        self.trial.response = Response::Class(class);
        self.mark("response");
    }

    /// Whether the next trial should repeat this one; valid after `Post`.
    pub fn correction_next(&self) -> bool {
        self.correction_next
    }

    /// Feed outside the reinforcement schedule. Component faults are
    /// absorbed as they are for scheduled rewards.
    pub fn free_reward(&mut self, value: Option<Duration>) -> Result<(), Error> {
        self.mark("reward");
        self.trial.reward = match self.panel.reward(value) {
            Ok(_) => Reinforcement::Delivered,
            Err(HardwareError::Component(fault)) => self.absorb("reward", fault)?,
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    /// Tag a component fault on the trial, count it and reset the panel.
    fn absorb(&mut self, which: &str, fault: ComponentError) -> Result<Reinforcement, Error> {
        warn!(trial = self.trial.index, which, error = %fault, "component fault");
        self.rig.events.emit("trial", "component_fault", Some(fault.tag()));
        self.mark(&format!("error:{}", fault.tag()));
        self.summary.record_fault(&fault);
        self.panel.reset()?;
        Ok(Reinforcement::Fault(fault.tag().to_owned()))
    }

    fn index_str(&self) -> String {
        self.trial.index.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialState {
    Pre,
    StimulusPre,
    StimulusMain,
    StimulusPost,
    ResponsePre,
    ResponseMain,
    ResponsePost,
    ConsequencePre,
    ConsequenceMain,
    ConsequencePost,
    Post,
    Abort,
}

type Phase = Result<Step<TrialState>, Error>;

pub struct TrialRun<'a> {
    pub behavior: &'a mut dyn Behavior,
    pub ctx: TrialCtx<'a>,
}

impl<'a> TrialRun<'a> {
    pub fn new(behavior: &'a mut dyn Behavior, ctx: TrialCtx<'a>) -> Self {
        Self { behavior, ctx }
    }

    /// `Completed` once the trial has been stored, or the signal that
    /// abandoned it.
    pub fn run(&mut self) -> Result<Outcome, Error> {
        use TrialState::*;
        StateMachine::<TrialState, TrialRun<'a>, Error>::new(Pre)
            .state(Pre, pre)
            .state(StimulusPre, stimulus_pre)
            .state(StimulusMain, stimulus_main)
            .state(StimulusPost, stimulus_post)
            .state(ResponsePre, response_pre)
            .state(ResponseMain, response_main)
            .state(ResponsePost, response_post)
            .state(ConsequencePre, consequence_pre)
            .state(ConsequenceMain, consequence_main)
            .state(ConsequencePost, consequence_post)
            .state(Post, post)
            .state(Abort, abort)
            .on_error(Abort, stash_fault)
            .run(self)
    }

    pub fn into_trial(self) -> Trial {
        self.ctx.trial
    }
}

fn session_boundary(ctx: &mut TrialCtx<'_>) -> Option<Step<TrialState>> {
    let signal = if ctx.rig.cancel.is_cancelled() {
        Signal::EndExperiment
    } else if !ctx.schedulers.is_active(ctx.rig.clock.as_ref()) {
        Signal::EndSession
    } else {
        return None;
    };
    ctx.panel.safe_state();
    info!(trial = ctx.trial.index, ?signal, "trial abandoned at session boundary");
    ctx.rig.events.emit("trial", "abandon", Some(&ctx.index_str()));
    Some(Step::Exit(signal))
}

fn pre(run: &mut TrialRun<'_>) -> Phase {
    let ctx = &mut run.ctx;
    ctx.started = ctx.rig.clock.now();
    ctx.trial.time = ctx.rig.clock.wall();
    ctx.trial.min_wait = ctx.trial.stimulus.duration;
    ctx.trial.max_wait = ctx.trial.min_wait + ctx.options.response_window;
    ctx.rig.events.emit("trial", "start", Some(&ctx.index_str()));
    debug!(
        trial = ctx.trial.index,
        condition = %ctx.trial.condition.name,
        stimulus = %ctx.trial.stimulus.name,
        kind = ctx.trial.trial_type.as_str(),
        "trial start"
    );
    run.behavior.trial_pre(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::StimulusPre))
}

fn stimulus_pre(run: &mut TrialRun<'_>) -> Phase {
    if let Some(exit) = session_boundary(&mut run.ctx) {
        return Ok(exit);
    }
    run.behavior.stimulus_pre(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::StimulusMain))
}

fn stimulus_main(run: &mut TrialRun<'_>) -> Phase {
    run.behavior.stimulus_main(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::StimulusPost))
}

fn stimulus_post(run: &mut TrialRun<'_>) -> Phase {
    run.behavior.stimulus_post(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::ResponsePre))
}

fn response_pre(run: &mut TrialRun<'_>) -> Phase {
    if let Some(exit) = session_boundary(&mut run.ctx) {
        return Ok(exit);
    }
    run.behavior.response_pre(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::ResponseMain))
}

fn response_main(run: &mut TrialRun<'_>) -> Phase {
    run.behavior.response_main(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::ResponsePost))
}

fn response_post(run: &mut TrialRun<'_>) -> Phase {
    run.behavior.response_post(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::ConsequencePre))
}

fn consequence_pre(run: &mut TrialRun<'_>) -> Phase {
    if let Some(exit) = session_boundary(&mut run.ctx) {
        return Ok(exit);
    }
    run.behavior.consequence_pre(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::ConsequenceMain))
}

fn consequence_main(run: &mut TrialRun<'_>) -> Phase {
    let trial = &mut run.ctx.trial;
    let Response::Class(class) = &trial.response else {
        trial.correct = false;
        return Ok(Step::Goto(TrialState::ConsequencePost));
    };
    trial.correct = *class == trial.condition.desired;

    if trial.correct {
        // A repeat answered correctly only clears correction mode.
        if trial.trial_type == TrialType::Correction {
            return Ok(Step::Goto(TrialState::ConsequencePost));
        }
        if trial.condition.is_rewarded && run.ctx.schedule.consequate(true) {
            run.ctx.trial.reward = deliver(run, Consequence::Reward)?;
        }
    } else if trial.condition.is_punished && run.ctx.schedule.consequate(false) {
        run.ctx.trial.punish = deliver(run, Consequence::Punish)?;
    }
    Ok(Step::Goto(TrialState::ConsequencePost))
}

fn consequence_post(run: &mut TrialRun<'_>) -> Phase {
    run.behavior.consequence_post(&mut run.ctx)?;
    Ok(Step::Goto(TrialState::Post))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consequence {
    Reward,
    Punish,
}

impl Consequence {
    fn as_str(self) -> &'static str {
        match self {
            Self::Reward => "reward",
            Self::Punish => "punish",
        }
    }
}

fn run_phases(run: &mut TrialRun<'_>, which: Consequence) -> Result<(), Error> {
    let (behavior, ctx) = (&mut *run.behavior, &mut run.ctx);
    match which {
        Consequence::Reward => {
            behavior.reward_pre(ctx)?;
            behavior.reward_main(ctx)?;
            behavior.reward_post(ctx)
        }
        Consequence::Punish => {
            behavior.punish_pre(ctx)?;
            behavior.punish_main(ctx)?;
            behavior.punish_post(ctx)
        }
    }
}

/// Run a reward or punish phase. Component faults are absorbed: tagged on
/// the trial, counted, and the panel reset.
fn deliver(run: &mut TrialRun<'_>, which: Consequence) -> Result<Reinforcement, Error> {
    match run_phases(run, which) {
        Ok(()) => Ok(Reinforcement::Delivered),
        Err(Error::Component(fault)) => run.ctx.absorb(which.as_str(), fault),
        Err(e) => Err(e),
    }
}

fn post(run: &mut TrialRun<'_>) -> Phase {
    run.ctx.trial.duration = Some(run.ctx.elapsed());
    run.behavior.trial_post(&mut run.ctx)?;

    let ctx = &mut run.ctx;
    ctx.store.append(&ctx.trial.to_record())?;
    ctx.schedulers.update(&ctx.trial);
    ctx.summary.record_trial(&ctx.trial);
    ctx.correction_next = ctx
        .options
        .correction
        .after(&ctx.trial, ctx.trial.trial_type == TrialType::Correction);
    ctx.rig.events.emit("trial", "end", Some(&ctx.index_str()));
    info!(
        trial = ctx.trial.index,
        response = ctx.trial.response.as_str(),
        correct = ctx.trial.correct,
        rt = ?ctx.trial.rt,
        "trial complete"
    );

    wait(ctx.rig.clock.as_ref(), ctx.options.intertrial_min, &ctx.rig.cancel);
    Ok(Step::Done)
}

fn stash_fault(run: &mut TrialRun<'_>, fault: Error) -> Result<(), Error> {
    run.ctx.fault = Some(fault);
    Ok(())
}

fn abort(run: &mut TrialRun<'_>) -> Phase {
    let ctx = &mut run.ctx;
    ctx.panel.safe_state();
    let fault = ctx
        .fault
        .take()
        .unwrap_or_else(|| UsageError::Invalid("trial aborted without a fault".into()).into());
    error!(
        trial = ctx.trial.index,
        kind = fault.kind().as_str(),
        error = %fault,
        "trial aborted"
    );
    ctx.rig.events.emit("trial", "abort", Some(fault.kind().as_str()));
    Err(fault)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::behavior::ChoiceBehavior;
    use crate::clock::{CancelToken, Clock, ManualClock};
    use crate::events::EventBus;
    use crate::panel::{PanelLayout, StandardPanel};
    use crate::reinforcement::ContinuousSchedule;
    use crate::schedulers::CountScheduler;
    use crate::sim::SimInterface;
    use crate::store::MemoryStore;

    pub(crate) fn contract(desired: &str) -> Contract {
        Contract {
            name: desired.into(),
            desired: desired.into(),
            is_rewarded: true,
            is_punished: true,
            reward_value: None,
            punish_value: None,
        }
    }

    pub(crate) fn sample_trial() -> Trial {
        Trial::new(
            0,
            0,
            0,
            TrialType::Normal,
            contract("left"),
            Stimulus::new("a.wav", Duration::from_millis(500)),
        )
    }

    const LEFT_IR: u32 = 10;
    const RIGHT_IR: u32 = 12;

    struct Bench {
        clock: ManualClock,
        sim: Arc<SimInterface>,
        panel: StandardPanel,
        rig: Rig,
        schedulers: StateSchedulers,
        store: MemoryStore,
        summary: Summary,
        options: TrialOptions,
    }

    impl Bench {
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
                options: TrialOptions {
                    response_window: Duration::from_millis(1500),
                    ..TrialOptions::default()
                },
            }
        }

        fn run(&mut self, trial: Trial) -> (Outcome, Trial, bool) {
            let mut behavior = ChoiceBehavior;
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
            let mut run = TrialRun::new(&mut behavior, ctx);
            let outcome = run.run().unwrap();
            let repeat = run.ctx.correction_next();
            (outcome, run.into_trial(), repeat)
        }
    }

    #[test]
    fn correct_response_is_rewarded() {
        let mut bench = Bench::new();
        bench
            .sim
            .press(LEFT_IR, Duration::from_millis(400), Duration::from_millis(50));
        let (outcome, trial, repeat) = bench.run(sample_trial());

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(trial.response, Response::Class("left".into()));
        assert!(trial.correct);
        let rt = trial.rt.unwrap().as_secs_f64();
        assert!((rt - 0.4).abs() < 0.01, "rt was {rt}");
        assert_eq!(trial.reward, Reinforcement::Delivered);
        assert_eq!(trial.punish, Reinforcement::Withheld);
        assert_eq!(trial.max_wait, Duration::from_secs(2));
        assert!(!repeat);

        let records = bench.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["response"], "left");
        assert_eq!(records[0]["reward"], true);
        assert_eq!(bench.summary.feeds, 1);
    }

    #[test]
    fn no_response_is_not_consequated() {
        let mut bench = Bench::new();
        let (outcome, trial, repeat) = bench.run(sample_trial());

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(trial.response, Response::None);
        assert!(!trial.correct);
        assert_eq!(trial.rt, None);
        assert_eq!(trial.reward, Reinforcement::Withheld);
        assert_eq!(trial.punish, Reinforcement::Withheld);
        assert!(!repeat);
        assert!(bench.clock.now() >= Duration::from_secs(2));
        assert_eq!(bench.store.records()[0]["response"], "none");
    }

    #[test]
    fn wrong_response_is_punished_and_corrected() {
        let mut bench = Bench::new();
        bench
            .sim
            .press(RIGHT_IR, Duration::from_millis(700), Duration::from_millis(50));
        let (_, trial, repeat) = bench.run(sample_trial());
        assert!(!trial.correct);
        assert_eq!(trial.punish, Reinforcement::Delivered);
        assert!(repeat);
        assert_eq!(bench.summary.timeouts, 1);
    }

    #[test]
    fn correct_correction_trial_is_not_fed() {
        let mut bench = Bench::new();
        bench
            .sim
            .press(LEFT_IR, Duration::from_millis(400), Duration::from_millis(50));
        let mut trial = sample_trial();
        trial.trial_type = TrialType::Correction;
        let (outcome, trial, repeat) = bench.run(trial);

        assert_eq!(outcome, Outcome::Completed);
        assert!(trial.correct);
        assert_eq!(trial.reward, Reinforcement::Withheld);
        assert!(!repeat);
        assert_eq!(bench.summary.feeds, 0);
        assert!(!bench.sim.output(PanelLayout::default().hopper_solenoid));
    }

    #[test]
    fn hopper_fault_is_tagged_not_fatal() {
        let mut bench = Bench::new();
        bench.sim.force(2, Some(false));
        bench
            .sim
            .press(LEFT_IR, Duration::from_millis(400), Duration::from_millis(50));
        let (outcome, trial, _) = bench.run(sample_trial());
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(trial.reward, Reinforcement::Fault("hopper_wont_come_up".into()));
        assert_eq!(bench.store.records()[0]["reward"], "error:hopper_wont_come_up");
        assert_eq!(bench.summary.hopper_failures, 1);
    }

    #[test]
    fn inactive_session_abandons_before_stimulus() {
        let mut bench = Bench::new();
        bench.schedulers.push(CountScheduler::new(0));
        let (outcome, trial, _) = bench.run(sample_trial());
        assert_eq!(outcome, Outcome::Signalled(Signal::EndSession));
        assert!(trial.onset.is_none());
        assert!(bench.store.records().is_empty());
    }

    #[test]
    fn interface_fault_aborts_the_trial() {
        let mut bench = Bench::new();
        bench.sim.fail(Some("usb reset"));
        let mut behavior = ChoiceBehavior;
        let mut schedule = ContinuousSchedule;
        let mut store = bench.store.clone();
        let ctx = TrialCtx::new(
            sample_trial(),
            &mut bench.panel,
            &bench.rig,
            &mut schedule,
            &mut bench.schedulers,
            &mut store,
            &mut bench.summary,
            &bench.options,
        );
        let err = TrialRun::new(&mut behavior, ctx).run().unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
        assert!(bench.store.records().is_empty());
    }

    #[test]
    fn correction_policy_modes() {
        let mut t = sample_trial();
        t.response = Response::Class("right".into());
        assert!(CorrectionPolicy::Incorrect.after(&t, false));
        assert!(!CorrectionPolicy::Off.after(&t, true));

        t.response = Response::None;
        assert!(CorrectionPolicy::Incorrect.after(&t, true));
        assert!(!CorrectionPolicy::Incorrect.after(&t, false));
        assert!(CorrectionPolicy::IncorrectOrNoResponse.after(&t, false));

        t.response = Response::Class("left".into());
        t.correct = true;
        assert!(!CorrectionPolicy::IncorrectOrNoResponse.after(&t, true));
    }

    #[test]
    fn annotations_do_not_shadow_core_fields() {
        let mut t = sample_trial();
        t.annotations.insert("index".into(), json!("bogus"));
        t.annotations.insert("probe".into(), json!(true));
        let record = t.to_record();
        assert_eq!(record["index"], 0);
        assert_eq!(record["probe"], true);
        assert_eq!(record["type"], "normal");
    }
}
