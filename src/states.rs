//! Life-cycle states: the outer `Idle → {Sleep | Session} → Idle` loop.

use tracing::{error, info, warn};

use crate::clock::wait;
use crate::error::{Error, FaultKind};
use crate::experiment::Experiment;
use crate::machine::{Signal, StateMachine, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifeState {
    Idle,
    Sleep,
    Session,
    Recover,
}

type Transition = Result<Step<LifeState>, Error>;

pub(crate) fn life_cycle() -> StateMachine<LifeState, Experiment, Error> {
    StateMachine::new(LifeState::Idle)
        .state(LifeState::Idle, idle)
        .state(LifeState::Sleep, sleep)
        .state(LifeState::Session, session)
        .state(LifeState::Recover, recover)
        .on_error(LifeState::Recover, on_fault)
}

fn idle(exp: &mut Experiment) -> Transition {
    exp.panel.idle()?;
    loop {
        if exp.rig.cancel.is_cancelled() {
            return Ok(Step::Exit(Signal::EndExperiment));
        }
        if exp.sessions_exhausted() {
            info!(sessions = exp.sessions_run, "session limit reached");
            return Ok(Step::Exit(Signal::EndExperiment));
        }
        let clock = exp.rig.clock.as_ref();
        if exp.session.is_active(clock) {
            return Ok(Step::Goto(LifeState::Session));
        }
        if !exp.sleep.is_empty() && exp.sleep.is_active(clock) {
            return Ok(Step::Goto(LifeState::Sleep));
        }
        wait(clock, exp.options.poll_interval, &exp.rig.cancel);
    }
}

fn sleep(exp: &mut Experiment) -> Transition {
    let clock = exp.rig.clock.clone();
    exp.sleep.enter(clock.as_ref());
    exp.rig.events.emit("experiment", "sleep", None);
    info!("sleep");
    let result = sleep_until_awake(exp);
    exp.sleep.exit(clock.as_ref());
    let signal = result?;
    exp.panel.wake()?;
    exp.rig.events.emit("experiment", "wake", None);
    Ok(match signal {
        Some(signal) => Step::Exit(signal),
        None => Step::Goto(LifeState::Idle),
    })
}

fn sleep_until_awake(exp: &mut Experiment) -> Result<Option<Signal>, Error> {
    exp.panel.sleep()?;
    let clock = exp.rig.clock.as_ref();
    while exp.sleep.is_active(clock) {
        if !wait(clock, exp.options.poll_interval, &exp.rig.cancel) {
            return Ok(Some(Signal::EndExperiment));
        }
    }
    Ok(None)
}

fn session(exp: &mut Experiment) -> Transition {
    let clock = exp.rig.clock.clone();
    exp.session.enter(clock.as_ref());
    exp.blocks.begin_session();
    let id = exp.session_index.to_string();
    exp.rig.events.emit("experiment", "session_start", Some(&id));
    info!(session = exp.session_index, "session start");

    let result = match exp.behavior.session_pre(exp.panel.as_mut()) {
        Ok(()) => exp.run_trials(),
        Err(e) => Err(e),
    };

    exp.session.exit(clock.as_ref());
    exp.session_index += 1;
    exp.rig.events.emit("experiment", "session_end", Some(&id));

    // A session cut short by a fault does not count toward the limit.
    let signal = result?;
    exp.sessions_run += 1;
    exp.summary.sessions += 1;
    exp.write_summary();
    exp.behavior.session_post(exp.panel.as_mut())?;
    info!(session = %id, ?signal, "session end");
    Ok(match signal {
        Signal::EndExperiment => Step::Exit(Signal::EndExperiment),
        Signal::EndSession => Step::Goto(LifeState::Idle),
    })
}

/// Hardware faults are retried up to the configured limit of consecutive
/// faults; anything else stops the runtime.
fn on_fault(exp: &mut Experiment, fault: Error) -> Result<(), Error> {
    let kind = fault.kind();
    exp.rig.events.emit("experiment", "fault", Some(kind.as_str()));
    match kind {
        FaultKind::Interface | FaultKind::Component => {
            exp.hardware_faults += 1;
            if exp.hardware_faults > exp.options.hardware_fault_limit {
                error!(
                    error = %fault,
                    faults = exp.hardware_faults,
                    "too many consecutive hardware faults, stopping"
                );
                return Err(fault);
            }
            error!(
                error = %fault,
                faults = exp.hardware_faults,
                "hardware fault, resetting panel"
            );
            Ok(())
        }
        FaultKind::Usage | FaultKind::Config | FaultKind::Storage => {
            error!(kind = kind.as_str(), error = %fault, "fatal fault");
            Err(fault)
        }
    }
}

fn recover(exp: &mut Experiment) -> Transition {
    exp.panel.safe_state();
    if let Err(e) = exp.panel.reset() {
        warn!(error = %e, "panel reset failed");
    }
    if !wait(exp.rig.clock.as_ref(), exp.options.recover_wait, &exp.rig.cancel) {
        return Ok(Step::Exit(Signal::EndExperiment));
    }
    Ok(Step::Goto(LifeState::Idle))
}
