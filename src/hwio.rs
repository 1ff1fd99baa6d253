//! Capability contract consumed from hardware drivers, and the thin
//! input/output wrappers the rest of the runtime talks to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{CancelToken, Clock, Duration};
use crate::conditions::Stimulus;
use crate::error::InterfaceError;

pub type Channel = u32;

/// A hardware driver. Methods take `&self` so one interface can be shared by
/// the control loop and event-handler threads; drivers synchronise
/// internally.
pub trait HardwareInterface: Send + Sync {
    fn name(&self) -> &str;

    fn read_bool(&self, channel: Channel) -> Result<bool, InterfaceError>;
    fn write_bool(&self, channel: Channel, value: bool) -> Result<(), InterfaceError>;

    /// Clock a bit sequence out of one line. Drivers with hardware-timed
    /// digital output should override this.
    fn write_bool_sequence(&self, channel: Channel, bits: &[bool]) -> Result<(), InterfaceError> {
        for &bit in bits {
            self.write_bool(channel, bit)?;
        }
        Ok(())
    }

    fn read_analog(&self, channel: Channel) -> Result<f64, InterfaceError>;
    fn write_analog(&self, channel: Channel, value: f64) -> Result<(), InterfaceError>;

    fn queue_audio(&self, channel: Channel, stimulus: &Stimulus) -> Result<(), InterfaceError>;
    fn play(&self, channel: Channel) -> Result<(), InterfaceError>;
    fn stop(&self, channel: Channel) -> Result<(), InterfaceError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOptions {
    /// `None` polls until cancelled.
    pub timeout: Option<Duration>,
    /// Ignore an input that is already held when polling starts until it has
    /// been released once.
    pub suppress_longpress: bool,
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            suppress_longpress: true,
            interval: Duration::from_millis(5),
        }
    }
}

impl PollOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct BooleanInput {
    interface: Arc<dyn HardwareInterface>,
    channel: Channel,
}

impl std::fmt::Debug for BooleanInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BooleanInput")
            .field("interface", &self.interface.name())
            .field("channel", &self.channel)
            .finish()
    }
}

impl BooleanInput {
    pub fn new(interface: Arc<dyn HardwareInterface>, channel: Channel) -> Self {
        Self { interface, channel }
    }

    pub fn read(&self) -> Result<bool, InterfaceError> {
        self.interface.read_bool(self.channel)
    }

    /// Monotonic time of the first qualifying `true` reading.
    pub fn poll(
        &self,
        clock: &dyn Clock,
        opts: &PollOptions,
        cancel: &CancelToken,
    ) -> Result<Option<Duration>, InterfaceError> {
        Ok(poll_any(std::slice::from_ref(self), clock, opts, cancel)?.map(|(_, at)| at))
    }
}

/// Poll several inputs together. Returns the index of the first input that
/// read `true` and when, or `None` on timeout or cancellation.
pub fn poll_any(
    inputs: &[BooleanInput],
    clock: &dyn Clock,
    opts: &PollOptions,
    cancel: &CancelToken,
) -> Result<Option<(usize, Duration)>, InterfaceError> {
    let deadline = opts.timeout.map(|t| clock.now() + t);
    let mut armed = if opts.suppress_longpress {
        inputs
            .iter()
            .map(|input| input.read().map(|held| !held))
            .collect::<Result<Vec<bool>, _>>()?
    } else {
        vec![true; inputs.len()]
    };

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        for (i, input) in inputs.iter().enumerate() {
            let value = input.read()?;
            if value && armed[i] {
                return Ok(Some((i, clock.now())));
            }
            if !value {
                armed[i] = true;
            }
        }

        let now = clock.now();
        let nap = match deadline {
            Some(deadline) if now >= deadline => return Ok(None),
            Some(deadline) => opts.interval.min(deadline - now),
            None => opts.interval,
        };
        clock.sleep(nap);
    }
}

/// Digital output that remembers the last value written.
pub struct BooleanOutput {
    interface: Arc<dyn HardwareInterface>,
    channel: Channel,
    last: AtomicBool,
}

impl std::fmt::Debug for BooleanOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BooleanOutput")
            .field("interface", &self.interface.name())
            .field("channel", &self.channel)
            .field("last", &self.read())
            .finish()
    }
}

impl BooleanOutput {
    pub fn new(interface: Arc<dyn HardwareInterface>, channel: Channel) -> Self {
        Self {
            interface,
            channel,
            last: AtomicBool::new(false),
        }
    }

    pub fn read(&self) -> bool {
        self.last.load(Ordering::SeqCst)
    }

    pub fn write(&self, value: bool) -> Result<(), InterfaceError> {
        self.interface.write_bool(self.channel, value)?;
        self.last.store(value, Ordering::SeqCst);
        Ok(())
    }

    pub fn toggle(&self) -> Result<bool, InterfaceError> {
        let value = !self.read();
        self.write(value)?;
        Ok(value)
    }

    pub fn write_sequence(&self, bits: &[bool]) -> Result<(), InterfaceError> {
        self.interface.write_bool_sequence(self.channel, bits)?;
        if let Some(&last) = bits.last() {
            self.last.store(last, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct AnalogInput {
    interface: Arc<dyn HardwareInterface>,
    channel: Channel,
}

impl AnalogInput {
    pub fn new(interface: Arc<dyn HardwareInterface>, channel: Channel) -> Self {
        Self { interface, channel }
    }

    pub fn read(&self) -> Result<f64, InterfaceError> {
        self.interface.read_analog(self.channel)
    }
}

#[derive(Clone)]
pub struct AnalogOutput {
    interface: Arc<dyn HardwareInterface>,
    channel: Channel,
}

impl AnalogOutput {
    pub fn new(interface: Arc<dyn HardwareInterface>, channel: Channel) -> Self {
        Self { interface, channel }
    }

    pub fn write(&self, value: f64) -> Result<(), InterfaceError> {
        self.interface.write_analog(self.channel, value)
    }
}

#[derive(Clone)]
pub struct AudioOutput {
    interface: Arc<dyn HardwareInterface>,
    channel: Channel,
}

impl AudioOutput {
    pub fn new(interface: Arc<dyn HardwareInterface>, channel: Channel) -> Self {
        Self { interface, channel }
    }

    pub fn queue(&self, stimulus: &Stimulus) -> Result<(), InterfaceError> {
        self.interface.queue_audio(self.channel, stimulus)
    }

    pub fn play(&self) -> Result<(), InterfaceError> {
        self.interface.play(self.channel)
    }

    pub fn stop(&self) -> Result<(), InterfaceError> {
        self.interface.stop(self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::SimInterface;

    fn rig() -> (ManualClock, Arc<SimInterface>) {
        let clock = ManualClock::new();
        let sim = Arc::new(SimInterface::new(Arc::new(clock.clone())));
        (clock, sim)
    }

    #[test]
    fn poll_reports_first_press() {
        let (clock, sim) = rig();
        sim.press(1, Duration::from_millis(400), Duration::from_millis(100));
        let input = BooleanInput::new(sim.clone(), 1);
        let opts = PollOptions::default().with_timeout(Duration::from_secs(2));
        let at = input.poll(&clock, &opts, &CancelToken::new()).unwrap().unwrap();
        assert!(at >= Duration::from_millis(400) && at < Duration::from_millis(410));
    }

    #[test]
    fn poll_times_out_at_deadline() {
        let (clock, sim) = rig();
        let input = BooleanInput::new(sim, 1);
        let opts = PollOptions::default().with_timeout(Duration::from_secs(2));
        assert!(input.poll(&clock, &opts, &CancelToken::new()).unwrap().is_none());
        assert_eq!(clock.now(), Duration::from_secs(2));
    }

    #[test]
    fn held_input_is_suppressed_until_released() {
        let (clock, sim) = rig();
        sim.press(1, Duration::ZERO, Duration::from_millis(300));
        sim.press(1, Duration::from_millis(500), Duration::from_millis(50));
        let input = BooleanInput::new(sim.clone(), 1);

        let opts = PollOptions::default().with_timeout(Duration::from_secs(1));
        let at = input.poll(&clock, &opts, &CancelToken::new()).unwrap().unwrap();
        assert!(at >= Duration::from_millis(500));

        let (clock, sim) = rig();
        sim.press(1, Duration::ZERO, Duration::from_millis(300));
        let input = BooleanInput::new(sim, 1);
        let opts = PollOptions {
            suppress_longpress: false,
            ..opts
        };
        let at = input.poll(&clock, &opts, &CancelToken::new()).unwrap().unwrap();
        assert_eq!(at, Duration::ZERO);
    }

    #[test]
    fn poll_any_names_the_port() {
        let (clock, sim) = rig();
        sim.press(3, Duration::from_millis(200), Duration::from_millis(50));
        let inputs = [BooleanInput::new(sim.clone(), 2), BooleanInput::new(sim, 3)];
        let opts = PollOptions::default().with_timeout(Duration::from_secs(1));
        let (port, _) = poll_any(&inputs, &clock, &opts, &CancelToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(port, 1);
    }

    #[test]
    fn cancelled_poll_returns_none() {
        let (clock, sim) = rig();
        let input = BooleanInput::new(sim, 1);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(input.poll(&clock, &PollOptions::default(), &cancel).unwrap().is_none());
    }

    #[test]
    fn output_remembers_last_value() {
        let (_clock, sim) = rig();
        let out = BooleanOutput::new(sim.clone(), 7);
        out.write(true).unwrap();
        assert!(out.read());
        assert!(sim.output(7));
        assert!(!out.toggle().unwrap());
        assert!(!sim.output(7));
    }

    #[test]
    fn analog_channels_pass_through() {
        let (_clock, sim) = rig();
        sim.set_analog_input(3, 1.25);
        assert_eq!(AnalogInput::new(sim.clone(), 3).read().unwrap(), 1.25);
        AnalogOutput::new(sim.clone(), 4).write(0.5).unwrap();
        assert_eq!(sim.analog_output(4), Some(0.5));
    }
}
