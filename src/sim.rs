//! Simulated hardware: scripted input presses, recorded outputs and a
//! stochastic subject that answers played stimuli.

use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::Rng;

use crate::clock::{Clock, Duration};
use crate::conditions::Stimulus;
use crate::error::InterfaceError;
use crate::hwio::{Channel, HardwareInterface};
use crate::reinforcement::seeded_rng;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Press {
    start: Duration,
    end: Duration,
}

/// Answers each played stimulus by scheduling a press on a response port.
///
/// The stimulus `label` names the correct response class. With probability
/// `response_rate` the subject responds at all; if it does, it picks the
/// correct port with probability `accuracy`.
#[derive(Debug)]
pub struct RandomResponder {
    ports: Vec<(String, Channel)>,
    pub accuracy: f64,
    pub response_rate: f64,
    pub latency: (Duration, Duration),
    pub hold: Duration,
    rng: StdRng,
}

impl RandomResponder {
    pub fn new(ports: Vec<(String, Channel)>, seed: Option<u64>) -> Self {
        Self {
            ports,
            accuracy: 0.8,
            response_rate: 0.9,
            latency: (Duration::from_millis(300), Duration::from_millis(1500)),
            hold: Duration::from_millis(80),
            rng: seeded_rng(seed),
        }
    }

    /// Channel pressed in answer to `stimulus`, and how long after onset.
    fn answer(&mut self, stimulus: &Stimulus) -> Option<(Channel, Duration)> {
        if self.ports.is_empty() || !self.rng.gen_bool(self.response_rate.clamp(0.0, 1.0)) {
            return None;
        }
        let target = stimulus
            .label
            .as_deref()
            .and_then(|label| self.ports.iter().position(|(class, _)| class == label));
        let pick = match target {
            Some(t) if self.rng.gen_bool(self.accuracy.clamp(0.0, 1.0)) => t,
            Some(t) if self.ports.len() > 1 => {
                let other = self.rng.gen_range(0..self.ports.len() - 1);
                if other >= t {
                    other + 1
                } else {
                    other
                }
            }
            _ => self.rng.gen_range(0..self.ports.len()),
        };
        let (lo, hi) = self.latency;
        let latency = if hi > lo { self.rng.gen_range(lo..hi) } else { lo };
        Some((self.ports[pick].1, stimulus.duration + latency))
    }
}

#[derive(Debug, Default)]
struct SimState {
    presses: HashMap<Channel, Vec<Press>>,
    forced: HashMap<Channel, bool>,
    links: HashMap<Channel, Channel>,
    outputs: HashMap<Channel, bool>,
    analog_in: HashMap<Channel, f64>,
    analog_out: HashMap<Channel, f64>,
    bit_writes: HashMap<Channel, Vec<bool>>,
    queued: HashMap<Channel, Stimulus>,
    playing: HashMap<Channel, Stimulus>,
    failure: Option<String>,
    responder: Option<RandomResponder>,
}

/// In-process [`HardwareInterface`] driven by a shared [`Clock`].
pub struct SimInterface {
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimInterface").finish_non_exhaustive()
    }
}

impl SimInterface {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_responder(self, responder: RandomResponder) -> Self {
        self.lock().responder = Some(responder);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, state: &SimState) -> Result<(), InterfaceError> {
        match &state.failure {
            Some(message) => Err(InterfaceError::communication("sim", message.clone())),
            None => Ok(()),
        }
    }

    /// Hold `channel` high from `at` (clock time) for `hold`.
    pub fn press(&self, channel: Channel, at: Duration, hold: Duration) {
        self.lock().presses.entry(channel).or_default().push(Press {
            start: at,
            end: at + hold,
        });
    }

    /// Pin an input to a value, overriding presses and links.
    pub fn force(&self, channel: Channel, value: Option<bool>) {
        let mut state = self.lock();
        match value {
            Some(v) => state.forced.insert(channel, v),
            None => state.forced.remove(&channel),
        };
    }

    /// Make `input` read whatever was last written to `output` (a hopper IR
    /// beam following its solenoid).
    pub fn link(&self, output: Channel, input: Channel) {
        self.lock().links.insert(input, output);
    }

    pub fn set_analog_input(&self, channel: Channel, value: f64) {
        self.lock().analog_in.insert(channel, value);
    }

    /// Make every call fail with an interface fault until cleared.
    pub fn fail(&self, message: Option<&str>) {
        self.lock().failure = message.map(str::to_owned);
    }

    pub fn output(&self, channel: Channel) -> bool {
        self.lock().outputs.get(&channel).copied().unwrap_or(false)
    }

    pub fn analog_output(&self, channel: Channel) -> Option<f64> {
        self.lock().analog_out.get(&channel).copied()
    }

    pub fn bit_writes(&self, channel: Channel) -> Vec<bool> {
        self.lock().bit_writes.get(&channel).cloned().unwrap_or_default()
    }

    pub fn playing(&self, channel: Channel) -> Option<Stimulus> {
        self.lock().playing.get(&channel).cloned()
    }
}

impl HardwareInterface for SimInterface {
    fn name(&self) -> &str {
        "sim"
    }

    fn read_bool(&self, channel: Channel) -> Result<bool, InterfaceError> {
        let state = self.lock();
        self.check(&state)?;
        if let Some(&value) = state.forced.get(&channel) {
            return Ok(value);
        }
        if let Some(output) = state.links.get(&channel) {
            return Ok(state.outputs.get(output).copied().unwrap_or(false));
        }
        let now = self.clock.now();
        Ok(state
            .presses
            .get(&channel)
            .is_some_and(|presses| presses.iter().any(|p| p.start <= now && now < p.end)))
    }

    fn write_bool(&self, channel: Channel, value: bool) -> Result<(), InterfaceError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.outputs.insert(channel, value);
        Ok(())
    }

    fn write_bool_sequence(&self, channel: Channel, bits: &[bool]) -> Result<(), InterfaceError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.bit_writes.entry(channel).or_default().extend_from_slice(bits);
        if let Some(&last) = bits.last() {
            state.outputs.insert(channel, last);
        }
        Ok(())
    }

    fn read_analog(&self, channel: Channel) -> Result<f64, InterfaceError> {
        let state = self.lock();
        self.check(&state)?;
        state
            .analog_in
            .get(&channel)
            .copied()
            .ok_or(InterfaceError::UnknownChannel {
                device: "sim".into(),
                channel,
            })
    }

    fn write_analog(&self, channel: Channel, value: f64) -> Result<(), InterfaceError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.analog_out.insert(channel, value);
        Ok(())
    }

    fn queue_audio(&self, channel: Channel, stimulus: &Stimulus) -> Result<(), InterfaceError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.queued.insert(channel, stimulus.clone());
        Ok(())
    }

    fn play(&self, channel: Channel) -> Result<(), InterfaceError> {
        let mut state = self.lock();
        self.check(&state)?;
        let Some(stimulus) = state.queued.remove(&channel) else {
            return Err(InterfaceError::communication("sim", "play without a queued stimulus"));
        };
        let now = self.clock.now();
        let answer = state
            .responder
            .as_mut()
            .and_then(|r| r.answer(&stimulus).map(|a| (a, r.hold)));
        if let Some(((port, after), hold)) = answer {
            state.presses.entry(port).or_default().push(Press {
                start: now + after,
                end: now + after + hold,
            });
        }
        state.playing.insert(channel, stimulus);
        Ok(())
    }

    fn stop(&self, channel: Channel) -> Result<(), InterfaceError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.playing.remove(&channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn presses_follow_the_clock() {
        let clock = ManualClock::new();
        let sim = SimInterface::new(Arc::new(clock.clone()));
        sim.press(4, Duration::from_millis(100), Duration::from_millis(50));
        assert!(!sim.read_bool(4).unwrap());
        clock.advance(Duration::from_millis(120));
        assert!(sim.read_bool(4).unwrap());
        clock.advance(Duration::from_millis(40));
        assert!(!sim.read_bool(4).unwrap());
    }

    #[test]
    fn linked_input_follows_output() {
        let sim = SimInterface::new(Arc::new(ManualClock::new()));
        sim.link(1, 2);
        sim.write_bool(1, true).unwrap();
        assert!(sim.read_bool(2).unwrap());
        sim.force(2, Some(false));
        assert!(!sim.read_bool(2).unwrap());
    }

    #[test]
    fn failure_is_an_interface_fault() {
        let sim = SimInterface::new(Arc::new(ManualClock::new()));
        sim.fail(Some("cable unplugged"));
        assert!(matches!(
            sim.read_bool(0),
            Err(InterfaceError::Communication { .. })
        ));
        sim.fail(None);
        assert!(sim.read_bool(0).is_ok());
    }

    #[test]
    fn responder_answers_played_stimuli() {
        let clock = ManualClock::new();
        let mut responder = RandomResponder::new(
            vec![("left".into(), 10), ("right".into(), 11)],
            Some(5),
        );
        responder.accuracy = 1.0;
        responder.response_rate = 1.0;
        let sim = SimInterface::new(Arc::new(clock.clone())).with_responder(responder);

        let mut stim = Stimulus::new("a", Duration::from_millis(500));
        stim.label = Some("right".into());
        sim.queue_audio(0, &stim).unwrap();
        sim.play(0).unwrap();

        clock.advance(Duration::from_secs(3));
        let presses = sim.lock().presses.get(&11).cloned().unwrap_or_default();
        assert_eq!(presses.len(), 1);
        assert!(presses[0].start >= Duration::from_millis(800));
        assert!(sim.lock().presses.get(&10).is_none());
    }
}
