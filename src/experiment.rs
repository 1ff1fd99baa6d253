//! The experiment context and its session trial loop.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::behavior::Behavior;
use crate::blocks::{BlockHandler, Drawn};
use crate::clock::Duration;
use crate::components::Rig;
use crate::error::{Error, UsageError};
use crate::machine::{Outcome, Signal};
use crate::panel::Panel;
use crate::schedulers::StateSchedulers;
use crate::states::life_cycle;
use crate::store::DataStore;
use crate::summary::Summary;
use crate::trial::{Trial, TrialCtx, TrialOptions, TrialRun, TrialType};

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentOptions {
    /// How often Idle and Sleep re-check their schedulers.
    pub poll_interval: Duration,
    /// Pause after a hardware fault before returning to Idle.
    pub recover_wait: Duration,
    /// Consecutive hardware faults tolerated before the runtime stops.
    pub hardware_fault_limit: u32,
    pub num_sessions: Option<u32>,
    pub trial: TrialOptions,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            recover_wait: Duration::from_secs(60),
            hardware_fault_limit: 10,
            num_sessions: None,
            trial: TrialOptions::default(),
        }
    }
}

pub struct Experiment {
    pub(crate) panel: Box<dyn Panel>,
    pub(crate) behavior: Box<dyn Behavior>,
    pub(crate) rig: Rig,
    pub(crate) store: Box<dyn DataStore>,
    pub(crate) blocks: BlockHandler,
    pub(crate) sleep: StateSchedulers,
    pub(crate) session: StateSchedulers,
    pub(crate) summary: Summary,
    pub(crate) options: ExperimentOptions,
    pub(crate) trial_index: u64,
    pub(crate) session_index: u32,
    pub(crate) sessions_run: u32,
    pub(crate) hardware_faults: u32,
    summary_path: Option<PathBuf>,
    /// The draw to repeat while correction mode is on.
    correction: Option<Drawn>,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("blocks", &self.blocks)
            .field("sleep", &self.sleep)
            .field("session", &self.session)
            .field("trial_index", &self.trial_index)
            .field("session_index", &self.session_index)
            .field("correction", &self.correction.is_some())
            .finish_non_exhaustive()
    }
}

impl Experiment {
    pub fn new(
        panel: Box<dyn Panel>,
        behavior: Box<dyn Behavior>,
        blocks: BlockHandler,
        store: Box<dyn DataStore>,
        rig: Rig,
    ) -> Self {
        Self {
            panel,
            behavior,
            rig,
            store,
            blocks,
            sleep: StateSchedulers::default(),
            session: StateSchedulers::default(),
            summary: Summary::new(),
            options: ExperimentOptions::default(),
            trial_index: 0,
            session_index: 0,
            sessions_run: 0,
            hardware_faults: 0,
            summary_path: None,
            correction: None,
        }
    }

    pub fn with_options(mut self, options: ExperimentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sleep_schedulers(mut self, schedulers: StateSchedulers) -> Self {
        self.sleep = schedulers;
        self
    }

    pub fn with_session_schedulers(mut self, schedulers: StateSchedulers) -> Self {
        self.session = schedulers;
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    /// Continue trial numbering from a previous run.
    pub fn with_first_trial_index(mut self, index: u64) -> Self {
        self.trial_index = index;
        self
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn trial_index(&self) -> u64 {
        self.trial_index
    }

    pub(crate) fn sessions_exhausted(&self) -> bool {
        self.options
            .num_sessions
            .is_some_and(|n| self.sessions_run >= n)
    }

    pub(crate) fn write_summary(&self) {
        if let Some(path) = &self.summary_path {
            if let Err(e) = self.summary.write_to(path) {
                warn!(path = %path.display(), error = %e, "could not write summary");
            }
        }
    }

    /// Run until the experiment ends: operator cancellation, the session
    /// limit, or an unrecoverable fault. The end-of-experiment hook runs in
    /// every case.
    pub fn run(&mut self) -> Result<(), Error> {
        info!("experiment start");
        self.rig.events.emit("experiment", "start", None);
        let result = match self.panel.reset() {
            Ok(()) => life_cycle().run(self),
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            self.panel.safe_state();
        }
        let end = self.behavior.experiment_end(self.panel.as_mut());
        self.write_summary();
        self.rig.events.emit("experiment", "end", None);
        self.rig.events.shutdown();
        info!(trials = self.summary.trials, "experiment end");
        result?;
        end
    }

    /// The trial loop of one session. Returns the signal that ended it.
    pub(crate) fn run_trials(&mut self) -> Result<Signal, Error> {
        loop {
            if self.rig.cancel.is_cancelled() {
                return Ok(Signal::EndExperiment);
            }
            if !self.session.is_active(self.rig.clock.as_ref()) {
                return Ok(Signal::EndSession);
            }
            let (drawn, trial_type) = match &self.correction {
                Some(drawn) => (drawn.clone(), TrialType::Correction),
                None => match self.blocks.draw()? {
                    Some(drawn) => (drawn, TrialType::Normal),
                    None => {
                        info!("every block is exhausted, ending session");
                        return Ok(Signal::EndSession);
                    }
                },
            };

            let mut trial = Trial::new(
                self.trial_index,
                self.session_index,
                drawn.block,
                trial_type,
                drawn.contract.clone(),
                drawn.stimulus.clone(),
            );
            trial.level = drawn.selection.level;
            trial.annotations = drawn.selection.annotations.clone();

            let Some(block) = self.blocks.current() else {
                return Err(UsageError::Invalid("no active block for the trial".into()).into());
            };
            let ctx = TrialCtx::new(
                trial,
                self.panel.as_mut(),
                &self.rig,
                block.reinforcement(),
                &mut self.session,
                self.store.as_mut(),
                &mut self.summary,
                &self.options.trial,
            );
            let mut run = TrialRun::new(self.behavior.as_mut(), ctx);
            let outcome = run.run()?;
            let repeat = run.ctx.correction_next();
            let trial = run.into_trial();

            if let Outcome::Signalled(signal) = outcome {
                return Ok(signal);
            }
            self.trial_index += 1;
            self.hardware_faults = 0;
            if trial_type == TrialType::Normal {
                if let Some(block) = self.blocks.current() {
                    block.complete(trial.correct, trial.response.is_none())?;
                }
            }
            self.correction = repeat.then_some(drawn);
        }
    }
}
