//! Experiment-specific hooks called by the trial and session machines.
//!
//! Every hook has a default. The defaults implement a plain choice task:
//! play the stimulus, light the response ports, take the first peck before
//! the deadline, feed or time out. Paradigms override only what differs.

use crate::error::Error;
use crate::panel::Panel;
use crate::trial::TrialCtx;

pub trait Behavior: Send {
    fn session_pre(&mut self, panel: &mut dyn Panel) -> Result<(), Error> {
        panel.ready()?;
        Ok(())
    }

    fn session_post(&mut self, panel: &mut dyn Panel) -> Result<(), Error> {
        panel.idle()?;
        Ok(())
    }

    /// Runs once when the experiment ends, after the last session.
    fn experiment_end(&mut self, panel: &mut dyn Panel) -> Result<(), Error> {
        panel.safe_state();
        Ok(())
    }

    fn trial_pre(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn stimulus_pre(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.panel.queue_stimulus(&ctx.trial.stimulus)?;
        Ok(())
    }

    fn stimulus_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.panel.play_stimulus()?;
        ctx.mark_onset();
        Ok(())
    }

    fn stimulus_post(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn response_pre(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.panel.ports_on(true)?;
        Ok(())
    }

    /// Poll until the first response or the deadline.
    fn response_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        let remaining = ctx.deadline().saturating_sub(ctx.rig.clock.now());
        if let Some((class, at)) = ctx.panel.poll_response(remaining)? {
            ctx.record_response(class, at);
        }
        Ok(())
    }

    fn response_post(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.panel.ports_on(false)?;
        ctx.panel.stop_stimulus()?;
        Ok(())
    }

    fn consequence_pre(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn consequence_post(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn reward_pre(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn reward_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.mark("reward");
        ctx.panel.reward(ctx.trial.condition.reward_value)?;
        Ok(())
    }

    fn reward_post(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn punish_pre(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn punish_main(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        ctx.mark("punish");
        ctx.panel.punish(ctx.trial.condition.punish_value)?;
        Ok(())
    }

    fn punish_post(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn trial_post(&mut self, _ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        Ok(())
    }
}

/// Go/no-go and two- or three-alternative choice with the default hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChoiceBehavior;

impl Behavior for ChoiceBehavior {}

/// Choice task that ignores pecks until the stimulus has finished playing.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForStimulusBehavior;

impl Behavior for WaitForStimulusBehavior {
    fn stimulus_post(&mut self, ctx: &mut TrialCtx<'_>) -> Result<(), Error> {
        let clock = ctx.rig.clock.as_ref();
        let end = ctx.deadline().saturating_sub(ctx.options.response_window);
        crate::clock::wait(clock, end.saturating_sub(clock.now()), &ctx.rig.cancel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{CancelToken, Duration, ManualClock};
    use crate::components::Rig;
    use crate::events::EventBus;
    use crate::panel::{PanelLayout, StandardPanel};
    use crate::reinforcement::ContinuousSchedule;
    use crate::schedulers::StateSchedulers;
    use crate::sim::SimInterface;
    use crate::store::MemoryStore;
    use crate::summary::Summary;
    use crate::trial::tests::sample_trial;
    use crate::trial::{Response, TrialOptions, TrialRun};

    fn run_with(behavior: &mut dyn Behavior, press_at: Duration) -> Response {
        let clock = ManualClock::new();
        let sim = Arc::new(SimInterface::new(Arc::new(clock.clone())));
        sim.link(1, 2);
        sim.press(10, press_at, Duration::from_millis(50));
        let rig = Rig::new(Arc::new(clock), CancelToken::new(), EventBus::default());
        let mut panel = StandardPanel::new(sim, &PanelLayout::default(), rig.clone());
        let mut schedule = ContinuousSchedule;
        let mut schedulers = StateSchedulers::default();
        let mut store = MemoryStore::new();
        let mut summary = Summary::new();
        let options = TrialOptions::default();
        let ctx = TrialCtx::new(
            sample_trial(),
            &mut panel,
            &rig,
            &mut schedule,
            &mut schedulers,
            &mut store,
            &mut summary,
            &options,
        );
        let mut run = TrialRun::new(behavior, ctx);
        run.run().unwrap();
        run.into_trial().response
    }

    #[test]
    fn default_hooks_accept_early_pecks() {
        let response = run_with(&mut ChoiceBehavior, Duration::from_millis(100));
        assert_eq!(response, Response::Class("left".into()));
    }

    #[test]
    fn waiting_behavior_ignores_pecks_during_stimulus() {
        let response = run_with(&mut WaitForStimulusBehavior, Duration::from_millis(100));
        assert_eq!(response, Response::None);
        let response = run_with(&mut WaitForStimulusBehavior, Duration::from_millis(900));
        assert_eq!(response, Response::Class("left".into()));
    }
}
