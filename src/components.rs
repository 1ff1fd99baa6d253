//! Physical components built from hwio channels.
//!
//! Every state change is announced on the event bus under the component's
//! name. Components that can disagree with their sensors raise
//! [`ComponentError`]s.

use std::sync::Arc;

use tracing::warn;

use crate::clock::{wait, CancelToken, Clock, Duration};
use crate::conditions::Stimulus;
use crate::error::{ComponentError, HardwareError, InterfaceError};
use crate::events::EventBus;
use crate::hwio::{AudioOutput, BooleanInput, BooleanOutput, PollOptions};

/// Runtime handles shared by every component on a panel.
#[derive(Clone)]
pub struct Rig {
    pub clock: Arc<dyn Clock>,
    pub cancel: CancelToken,
    pub events: EventBus,
}

impl Rig {
    pub fn new(clock: Arc<dyn Clock>, cancel: CancelToken, events: EventBus) -> Self {
        Self {
            clock,
            cancel,
            events,
        }
    }

    fn wait(&self, duration: Duration) -> bool {
        wait(self.clock.as_ref(), duration, &self.cancel)
    }
}

/// A feeder raised by a solenoid, optionally watched by an IR beam.
pub struct Hopper {
    name: String,
    solenoid: BooleanOutput,
    ir: Option<BooleanInput>,
    /// How long the hopper may take to come up or drop.
    max_lag: Duration,
    rig: Rig,
}

impl Hopper {
    pub fn new(
        name: impl Into<String>,
        solenoid: BooleanOutput,
        ir: Option<BooleanInput>,
        max_lag: Duration,
        rig: Rig,
    ) -> Self {
        Self {
            name: name.into(),
            solenoid,
            ir,
            max_lag,
            rig,
        }
    }

    pub fn max_lag(&self) -> Duration {
        self.max_lag
    }

    /// Whether the hopper is up; an error if beam and solenoid disagree.
    pub fn check(&self) -> Result<bool, HardwareError> {
        let solenoid = self.solenoid.read();
        let Some(ir) = &self.ir else {
            return Ok(solenoid);
        };
        match (ir.read()?, solenoid) {
            (beam, sol) if beam == sol => Ok(beam),
            (true, false) => Err(ComponentError::HopperActive.into()),
            _ => Err(ComponentError::HopperInactive.into()),
        }
    }

    /// Raise the hopper; monotonic time it came up.
    pub fn up(&self) -> Result<Duration, HardwareError> {
        self.solenoid.write(true)?;
        self.rig.events.emit(&self.name, "up", None);
        let Some(ir) = &self.ir else {
            return Ok(self.rig.clock.now());
        };
        let opts = PollOptions {
            timeout: Some(self.max_lag),
            suppress_longpress: false,
            ..PollOptions::default()
        };
        match ir.poll(self.rig.clock.as_ref(), &opts, &self.rig.cancel)? {
            Some(at) => Ok(at),
            None => {
                self.solenoid.write(false)?;
                Err(ComponentError::HopperWontComeUp.into())
            }
        }
    }

    /// Lower the hopper; monotonic time the solenoid was released.
    pub fn down(&self) -> Result<Duration, HardwareError> {
        self.solenoid.write(false)?;
        self.rig.events.emit(&self.name, "down", None);
        let at = self.rig.clock.now();
        self.rig.wait(self.max_lag);
        match self.check() {
            Err(HardwareError::Component(ComponentError::HopperActive)) => {
                Err(ComponentError::HopperWontDrop.into())
            }
            Err(e) => Err(e),
            Ok(_) => Ok(at),
        }
    }

    /// Raise for `duration`, then lower. Returns when the feed started and
    /// how long it lasted.
    pub fn feed(&self, duration: Duration) -> Result<(Duration, Duration), HardwareError> {
        match self.check() {
            Err(HardwareError::Component(ComponentError::HopperActive)) => {
                self.solenoid.write(false)?;
                return Err(ComponentError::HopperAlreadyUp.into());
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }
        let start = self.up()?;
        self.rig.wait(duration);
        let end = self.down()?;
        Ok((start, end.saturating_sub(start)))
    }

    /// Best effort: drop the hopper.
    pub fn off(&self) -> Result<(), InterfaceError> {
        self.solenoid.write(false)
    }
}

/// A response port: IR beam plus cue LED.
pub struct PeckPort {
    name: String,
    ir: BooleanInput,
    led: BooleanOutput,
    rig: Rig,
}

impl PeckPort {
    pub fn new(name: impl Into<String>, ir: BooleanInput, led: BooleanOutput, rig: Rig) -> Self {
        Self {
            name: name.into(),
            ir,
            led,
            rig,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &BooleanInput {
        &self.ir
    }

    pub fn status(&self) -> Result<bool, InterfaceError> {
        self.ir.read()
    }

    pub fn on(&self) -> Result<(), InterfaceError> {
        self.led.write(true)?;
        self.rig.events.emit(&self.name, "on", None);
        Ok(())
    }

    pub fn off(&self) -> Result<(), InterfaceError> {
        self.led.write(false)?;
        self.rig.events.emit(&self.name, "off", None);
        Ok(())
    }

    /// Toggle the LED every `isi` for up to `duration`, polling the beam
    /// every `poll` in between. Stops at the first peck and restores the LED.
    /// Returns when the peck landed.
    pub fn flash(
        &self,
        duration: Duration,
        isi: Duration,
        poll: Duration,
    ) -> Result<Option<Duration>, HardwareError> {
        if isi.is_zero() || poll.is_zero() {
            return Err(ComponentError::Other {
                component: self.name.clone(),
                message: "flash and poll intervals must be positive".into(),
            }
            .into());
        }
        let prior = self.led.read();
        let end = self.rig.clock.now() + duration;
        let mut opts = PollOptions {
            timeout: None,
            suppress_longpress: true,
            interval: poll,
        };
        let mut hit = None;
        loop {
            let now = self.rig.clock.now();
            if now >= end || self.rig.cancel.is_cancelled() {
                break;
            }
            self.led.toggle()?;
            opts.timeout = Some(isi.min(end - now));
            hit = self.ir.poll(self.rig.clock.as_ref(), &opts, &self.rig.cancel)?;
            if hit.is_some() {
                self.rig.events.emit(&self.name, "peck", None);
                break;
            }
        }
        self.led.write(prior)?;
        Ok(hit)
    }

    /// Light the LED for up to `timeout` or until the first peck.
    pub fn cue(&self, timeout: Duration, poll: Duration) -> Result<Option<Duration>, HardwareError> {
        let opts = PollOptions {
            timeout: Some(timeout),
            suppress_longpress: true,
            interval: poll,
        };
        self.on()?;
        let hit = self.ir.poll(self.rig.clock.as_ref(), &opts, &self.rig.cancel);
        self.off()?;
        let hit = hit?;
        if hit.is_some() {
            self.rig.events.emit(&self.name, "peck", None);
        }
        Ok(hit)
    }
}

pub struct HouseLight {
    name: String,
    light: BooleanOutput,
    rig: Rig,
}

impl HouseLight {
    pub fn new(name: impl Into<String>, light: BooleanOutput, rig: Rig) -> Self {
        Self {
            name: name.into(),
            light,
            rig,
        }
    }

    pub fn on(&self) -> Result<(), InterfaceError> {
        self.light.write(true)?;
        self.rig.events.emit(&self.name, "on", None);
        Ok(())
    }

    pub fn off(&self) -> Result<(), InterfaceError> {
        self.light.write(false)?;
        self.rig.events.emit(&self.name, "off", None);
        Ok(())
    }

    pub fn is_on(&self) -> bool {
        self.light.read()
    }

    /// Lights out for `duration`; the punishment timeout.
    pub fn timeout(&self, duration: Duration) -> Result<Duration, InterfaceError> {
        let start = self.rig.clock.now();
        self.off()?;
        let finished = self.rig.wait(duration);
        self.on()?;
        if !finished {
            warn!(light = %self.name, "timeout cut short by cancellation");
        }
        Ok(self.rig.clock.now().saturating_sub(start))
    }
}

pub struct Speaker {
    name: String,
    output: AudioOutput,
    rig: Rig,
}

impl Speaker {
    pub fn new(name: impl Into<String>, output: AudioOutput, rig: Rig) -> Self {
        Self {
            name: name.into(),
            output,
            rig,
        }
    }

    pub fn queue(&self, stimulus: &Stimulus) -> Result<(), InterfaceError> {
        self.output.queue(stimulus)?;
        self.rig.events.emit(&self.name, "queue", Some(&stimulus.name));
        Ok(())
    }

    pub fn play(&self) -> Result<(), InterfaceError> {
        self.output.play()?;
        self.rig.events.emit(&self.name, "play", None);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), InterfaceError> {
        self.output.stop()?;
        self.rig.events.emit(&self.name, "stop", None);
        Ok(())
    }
}
