//! The operant panel: logical roles the trial runner drives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Duration;
use crate::components::{Hopper, HouseLight, PeckPort, Rig, Speaker};
use crate::conditions::Stimulus;
use crate::error::{ComponentError, HardwareError};
use crate::hwio::{
    poll_any, AudioOutput, BooleanInput, BooleanOutput, Channel, HardwareInterface, PollOptions,
};

pub trait Panel: Send {
    /// Neutral state at start-up and after a fault.
    fn reset(&mut self) -> Result<(), HardwareError>;
    /// Prepare for a session.
    fn ready(&mut self) -> Result<(), HardwareError>;
    /// Between sessions.
    fn idle(&mut self) -> Result<(), HardwareError>;
    /// Every subject-facing output off.
    fn sleep(&mut self) -> Result<(), HardwareError>;
    fn wake(&mut self) -> Result<(), HardwareError>;

    fn queue_stimulus(&mut self, stimulus: &Stimulus) -> Result<(), HardwareError>;
    fn play_stimulus(&mut self) -> Result<(), HardwareError>;
    fn stop_stimulus(&mut self) -> Result<(), HardwareError>;

    /// Response-port cue lights.
    fn ports_on(&mut self, on: bool) -> Result<(), HardwareError>;

    /// Block until a response port fires or `timeout` passes. Returns the
    /// response class and the monotonic time of the response.
    fn poll_response(&mut self, timeout: Duration)
        -> Result<Option<(String, Duration)>, HardwareError>;

    /// Cue the port answering `class` until it is pecked or `timeout`
    /// passes, toggling it every `flash` if given. Other ports stay dark.
    /// Returns when the cued port was pecked.
    fn cue_port(
        &mut self,
        class: &str,
        timeout: Duration,
        flash: Option<Duration>,
    ) -> Result<Option<Duration>, HardwareError>;

    /// Deliver a reward; `None` uses the panel default. Returns how long it
    /// lasted.
    fn reward(&mut self, value: Option<Duration>) -> Result<Duration, HardwareError>;
    fn punish(&mut self, value: Option<Duration>) -> Result<Duration, HardwareError>;

    /// Best-effort hardware-safe shutdown; failures are logged, not returned.
    fn safe_state(&mut self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortLayout {
    /// Response class reported when this port fires.
    pub class: String,
    pub ir: Channel,
    pub led: Channel,
}

/// Channel assignment for a [`StandardPanel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelLayout {
    pub house_light: Channel,
    pub hopper_solenoid: Channel,
    #[serde(default)]
    pub hopper_ir: Option<Channel>,
    pub speaker: Channel,
    pub ports: Vec<PortLayout>,
    #[serde(default = "default_max_lag_s")]
    pub hopper_max_lag_s: f64,
    #[serde(default = "default_reward_s")]
    pub reward_s: f64,
    #[serde(default = "default_punish_s")]
    pub punish_s: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_lag_s() -> f64 {
    0.3
}
fn default_reward_s() -> f64 {
    2.0
}
fn default_punish_s() -> f64 {
    10.0
}
fn default_poll_interval_ms() -> u64 {
    5
}

impl Default for PanelLayout {
    fn default() -> Self {
        Self {
            house_light: 0,
            hopper_solenoid: 1,
            hopper_ir: Some(2),
            speaker: 3,
            ports: vec![
                PortLayout {
                    class: "left".into(),
                    ir: 10,
                    led: 20,
                },
                PortLayout {
                    class: "center".into(),
                    ir: 11,
                    led: 21,
                },
                PortLayout {
                    class: "right".into(),
                    ir: 12,
                    led: 22,
                },
            ],
            hopper_max_lag_s: default_max_lag_s(),
            reward_s: default_reward_s(),
            punish_s: default_punish_s(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// House light, hopper, speaker and a row of peck ports. Rewards feed;
/// punishments are house-light timeouts.
pub struct StandardPanel {
    house_light: HouseLight,
    hopper: Hopper,
    speaker: Speaker,
    ports: Vec<PeckPort>,
    inputs: Vec<BooleanInput>,
    rig: Rig,
    poll_interval: Duration,
    reward_value: Duration,
    punish_value: Duration,
}

impl StandardPanel {
    pub fn new(interface: Arc<dyn HardwareInterface>, layout: &PanelLayout, rig: Rig) -> Self {
        let ports: Vec<PeckPort> = layout
            .ports
            .iter()
            .map(|p| {
                PeckPort::new(
                    p.class.clone(),
                    BooleanInput::new(interface.clone(), p.ir),
                    BooleanOutput::new(interface.clone(), p.led),
                    rig.clone(),
                )
            })
            .collect();
        let inputs = ports.iter().map(|p| p.input().clone()).collect();
        Self {
            house_light: HouseLight::new(
                "house_light",
                BooleanOutput::new(interface.clone(), layout.house_light),
                rig.clone(),
            ),
            hopper: Hopper::new(
                "hopper",
                BooleanOutput::new(interface.clone(), layout.hopper_solenoid),
                layout
                    .hopper_ir
                    .map(|ch| BooleanInput::new(interface.clone(), ch)),
                Duration::from_secs_f64(layout.hopper_max_lag_s),
                rig.clone(),
            ),
            speaker: Speaker::new("speaker", AudioOutput::new(interface, layout.speaker), rig.clone()),
            ports,
            inputs,
            rig,
            poll_interval: Duration::from_millis(layout.poll_interval_ms.max(1)),
            reward_value: Duration::from_secs_f64(layout.reward_s),
            punish_value: Duration::from_secs_f64(layout.punish_s),
        }
    }

    fn ports_off(&self) -> Result<(), HardwareError> {
        for port in &self.ports {
            port.off()?;
        }
        Ok(())
    }
}

impl Panel for StandardPanel {
    fn reset(&mut self) -> Result<(), HardwareError> {
        self.ports_off()?;
        self.hopper.off()?;
        self.house_light.on()?;
        Ok(())
    }

    fn ready(&mut self) -> Result<(), HardwareError> {
        self.hopper.off()?;
        self.ports_off()?;
        self.house_light.on()?;
        Ok(())
    }

    fn idle(&mut self) -> Result<(), HardwareError> {
        self.ports_off()?;
        self.hopper.off()?;
        self.house_light.on()?;
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), HardwareError> {
        self.ports_off()?;
        self.hopper.off()?;
        self.house_light.off()?;
        Ok(())
    }

    fn wake(&mut self) -> Result<(), HardwareError> {
        self.house_light.on()?;
        Ok(())
    }

    fn queue_stimulus(&mut self, stimulus: &Stimulus) -> Result<(), HardwareError> {
        self.speaker.queue(stimulus)?;
        Ok(())
    }

    fn play_stimulus(&mut self) -> Result<(), HardwareError> {
        self.speaker.play()?;
        Ok(())
    }

    fn stop_stimulus(&mut self) -> Result<(), HardwareError> {
        self.speaker.stop()?;
        Ok(())
    }

    fn ports_on(&mut self, on: bool) -> Result<(), HardwareError> {
        for port in &self.ports {
            if on {
                port.on()?;
            } else {
                port.off()?;
            }
        }
        Ok(())
    }

    fn poll_response(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(String, Duration)>, HardwareError> {
        let opts = PollOptions {
            timeout: Some(timeout),
            suppress_longpress: true,
            interval: self.poll_interval,
        };
        let hit = poll_any(&self.inputs, self.rig.clock.as_ref(), &opts, &self.rig.cancel)?;
        Ok(hit.map(|(i, at)| (self.ports[i].name().to_owned(), at)))
    }

    fn cue_port(
        &mut self,
        class: &str,
        timeout: Duration,
        flash: Option<Duration>,
    ) -> Result<Option<Duration>, HardwareError> {
        let Some(port) = self.ports.iter().find(|p| p.name() == class) else {
            return Err(ComponentError::Other {
                component: "panel".into(),
                message: format!("no response port for class {class:?}"),
            }
            .into());
        };
        match flash {
            Some(isi) => port.flash(timeout, isi, self.poll_interval),
            None => port.cue(timeout, self.poll_interval),
        }
    }

    fn reward(&mut self, value: Option<Duration>) -> Result<Duration, HardwareError> {
        let (_, duration) = self.hopper.feed(value.unwrap_or(self.reward_value))?;
        Ok(duration)
    }

    fn punish(&mut self, value: Option<Duration>) -> Result<Duration, HardwareError> {
        Ok(self.house_light.timeout(value.unwrap_or(self.punish_value))?)
    }

    fn safe_state(&mut self) {
        if let Err(e) = self.hopper.off() {
            warn!(error = %e, "could not drop hopper");
        }
        if let Err(e) = self.speaker.stop() {
            warn!(error = %e, "could not stop speaker");
        }
        if let Err(e) = self.ports_off() {
            warn!(error = %e, "could not turn off response ports");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{CancelToken, Clock, ManualClock};
    use crate::events::EventBus;
    use crate::sim::SimInterface;

    fn panel() -> (ManualClock, Arc<SimInterface>, StandardPanel) {
        let clock = ManualClock::new();
        let sim = Arc::new(SimInterface::new(Arc::new(clock.clone())));
        let layout = PanelLayout::default();
        sim.link(layout.hopper_solenoid, 2);
        let rig = Rig::new(Arc::new(clock.clone()), CancelToken::new(), EventBus::default());
        let panel = StandardPanel::new(sim.clone(), &layout, rig);
        (clock, sim, panel)
    }

    #[test]
    fn response_names_the_port_class() {
        let (clock, sim, mut panel) = panel();
        sim.press(12, Duration::from_millis(250), Duration::from_millis(50));
        let (class, at) = panel.poll_response(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(class, "right");
        assert!(at >= Duration::from_millis(250));
        assert!(clock.now() < Duration::from_millis(300));
    }

    #[test]
    fn cued_port_ignores_the_other_ports() {
        let (clock, sim, mut panel) = panel();
        sim.press(10, Duration::from_millis(300), Duration::from_millis(50));
        sim.press(11, Duration::from_millis(1200), Duration::from_millis(50));
        let at = panel
            .cue_port("center", Duration::from_secs(10), Some(Duration::from_millis(500)))
            .unwrap()
            .unwrap();
        assert!(at >= Duration::from_millis(1200));
        assert!(clock.now() < Duration::from_millis(1300));
        assert!(!sim.output(21));

        let miss = panel.cue_port("right", Duration::from_secs(2), None).unwrap();
        assert_eq!(miss, None);
        assert!(!sim.output(22));
        assert!(panel.cue_port("up", Duration::from_secs(1), None).is_err());
    }

    #[test]
    fn sleep_turns_everything_off() {
        let (_clock, sim, mut panel) = panel();
        panel.reset().unwrap();
        panel.ports_on(true).unwrap();
        assert!(sim.output(0) && sim.output(20));
        panel.sleep().unwrap();
        assert!(!sim.output(0));
        assert!(!sim.output(20) && !sim.output(21) && !sim.output(22));
        panel.wake().unwrap();
        assert!(sim.output(0));
    }

    #[test]
    fn reward_uses_default_feed_duration() {
        let (clock, _sim, mut panel) = panel();
        let fed = panel.reward(None).unwrap();
        assert_eq!(fed, Duration::from_secs(2));
        assert_eq!(clock.now(), Duration::from_millis(2300));
    }

    #[test]
    fn punish_is_a_lights_out_timeout() {
        let (_clock, sim, mut panel) = panel();
        panel.reset().unwrap();
        let took = panel.punish(Some(Duration::from_secs(3))).unwrap();
        assert_eq!(took, Duration::from_secs(3));
        assert!(sim.output(0));
    }
}
