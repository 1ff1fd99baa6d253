pub use core::time::Duration;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, TimeDelta};

/// Longest uninterrupted sleep inside [`wait`]; bounds cancellation latency.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Time source for the control loop.
///
/// `now()` is monotonic and is what reaction times and deadlines are measured
/// against. `wall()` is only used for timestamps and time-of-day schedules.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn wall(&self) -> DateTime<Local>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly.
///
/// Clones share the same timeline, so a simulated interface and the runtime
/// can observe one clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
    wall_origin: DateTime<Local>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Local::now())
    }

    pub fn starting_at(wall_origin: DateTime<Local>) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(0)),
            wall_origin,
        }
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = duration.as_nanos().min(u64::MAX as u128) as u64;
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn wall(&self) -> DateTime<Local> {
        let offset = TimeDelta::from_std(self.now()).unwrap_or(TimeDelta::zero());
        self.wall_origin + offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Cooperative cancellation flag shared between the control loop and
/// whoever may interrupt it (operator signal, fatal fault).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for `duration`, waking every [`WAIT_SLICE`] to check `cancel`.
///
/// Returns `false` if the wait was cut short by cancellation.
pub fn wait(clock: &dyn Clock, duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = clock.now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = clock.now();
        if now >= deadline {
            return true;
        }
        clock.sleep((deadline - now).min(WAIT_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        clock.sleep(Duration::from_millis(400));
        assert_eq!(shared.now(), Duration::from_millis(400));
        assert_eq!(
            (clock.wall() - clock.wall_origin).num_milliseconds(),
            400
        );
    }

    #[test]
    fn wait_stops_early_when_cancelled() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        assert!(wait(&clock, Duration::from_secs(1), &cancel));
        assert_eq!(clock.now(), Duration::from_secs(1));

        cancel.cancel();
        assert!(!wait(&clock, Duration::from_secs(1), &cancel));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }
}
