//! Activation predicates attached to life-cycle states.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Duration};
use crate::error::ConfigError;
use crate::trial::Trial;

pub trait Scheduler: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, _clock: &dyn Clock) {}

    fn stop(&mut self, _clock: &dyn Clock) {}

    /// Called after every completed trial while the owning state is active.
    fn update(&mut self, _trial: &Trial) {}

    fn check(&self, clock: &dyn Clock) -> bool;
}

/// The schedulers of one life-cycle state. A state with none is always
/// active.
#[derive(Default)]
pub struct StateSchedulers {
    schedulers: Vec<Box<dyn Scheduler>>,
}

impl std::fmt::Debug for StateSchedulers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.schedulers.iter().map(|s| s.name()))
            .finish()
    }
}

impl StateSchedulers {
    pub fn new(schedulers: Vec<Box<dyn Scheduler>>) -> Self {
        Self { schedulers }
    }

    pub fn push(&mut self, scheduler: impl Scheduler + 'static) {
        self.schedulers.push(Box::new(scheduler));
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    pub fn enter(&mut self, clock: &dyn Clock) {
        for s in &mut self.schedulers {
            s.start(clock);
        }
    }

    pub fn exit(&mut self, clock: &dyn Clock) {
        for s in &mut self.schedulers {
            s.stop(clock);
        }
    }

    pub fn update(&mut self, trial: &Trial) {
        for s in &mut self.schedulers {
            s.update(trial);
        }
    }

    pub fn is_active(&self, clock: &dyn Clock) -> bool {
        self.schedulers.iter().all(|s| s.check(clock))
    }
}

/// Parse `HH:MM`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ConfigError::TimeOfDay(s.to_owned()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Windows {
    /// Wall-clock `[start, end)` windows; `end < start` wraps midnight.
    Periods(Vec<(NaiveTime, NaiveTime)>),
    /// Between local sunrise and sunset.
    Sun(Location),
    /// Between local sunset and the next sunrise.
    Night(Location),
}

#[derive(Debug, Clone)]
pub struct TimeOfDayScheduler {
    windows: Windows,
}

impl TimeOfDayScheduler {
    pub fn new(windows: Windows) -> Self {
        Self { windows }
    }

    pub fn windows(&self) -> &Windows {
        &self.windows
    }

    pub fn is_active_at(&self, at: DateTime<Local>) -> bool {
        match &self.windows {
            Windows::Periods(periods) => {
                let t = at.time();
                periods.iter().any(|&(start, end)| {
                    if start <= end {
                        start <= t && t < end
                    } else {
                        t >= start || t < end
                    }
                })
            }
            Windows::Sun(loc) => is_daylight(at.with_timezone(&Utc), loc),
            Windows::Night(loc) => !is_daylight(at.with_timezone(&Utc), loc),
        }
    }
}

impl Scheduler for TimeOfDayScheduler {
    fn name(&self) -> &'static str {
        "time_of_day"
    }

    fn check(&self, clock: &dyn Clock) -> bool {
        self.is_active_at(clock.wall())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Daylight {
    Always,
    Never,
    Between(DateTime<Utc>, DateTime<Utc>),
}

const ZENITH_DEG: f64 = 90.833;

/// Sunrise or sunset in UTC hours for `date` (almanac algorithm, accurate to
/// a minute or two away from the poles). Errs with the polar case when the
/// sun stays up or down all day.
fn sun_event_ut(date: NaiveDate, loc: &Location, rising: bool) -> Result<f64, Daylight> {
    let n = f64::from(date.ordinal());
    let lng_hour = loc.longitude / 15.0;
    let t = n + ((if rising { 6.0 } else { 18.0 }) - lng_hour) / 24.0;

    let m = 0.9856 * t - 3.289;
    let l = (m + 1.916 * m.to_radians().sin() + 0.020 * (2.0 * m).to_radians().sin() + 282.634)
        .rem_euclid(360.0);

    let mut ra = (0.91764 * l.to_radians().tan()).atan().to_degrees().rem_euclid(360.0);
    ra += (l / 90.0).floor() * 90.0 - (ra / 90.0).floor() * 90.0;
    ra /= 15.0;

    let sin_dec = 0.39782 * l.to_radians().sin();
    let cos_dec = sin_dec.asin().cos();
    let lat = loc.latitude.to_radians();
    let cos_h = (ZENITH_DEG.to_radians().cos() - sin_dec * lat.sin()) / (cos_dec * lat.cos());
    if cos_h > 1.0 {
        return Err(Daylight::Never);
    }
    if cos_h < -1.0 {
        return Err(Daylight::Always);
    }

    let h = if rising {
        360.0 - cos_h.acos().to_degrees()
    } else {
        cos_h.acos().to_degrees()
    } / 15.0;
    let local_t = h + ra - 0.06571 * t - 6.622;
    Ok((local_t - lng_hour).rem_euclid(24.0))
}

fn daylight_on(date: NaiveDate, loc: &Location) -> Daylight {
    let (rise, set) = match (sun_event_ut(date, loc, true), sun_event_ut(date, loc, false)) {
        (Ok(rise), Ok(set)) => (rise, set),
        (Err(d), _) | (_, Err(d)) => return d,
    };
    let midnight = date.and_time(NaiveTime::MIN).and_utc();
    let at = |hours: f64| midnight + ChronoDuration::seconds((hours * 3600.0) as i64);
    let rise = at(rise);
    let mut set = at(set);
    if set < rise {
        set += ChronoDuration::days(1);
    }
    Daylight::Between(rise, set)
}

fn is_daylight(now: DateTime<Utc>, loc: &Location) -> bool {
    let today = now.date_naive();
    let days = [today.pred_opt(), Some(today), today.succ_opt()];
    let mut polar = None;
    for date in days.into_iter().flatten() {
        match daylight_on(date, loc) {
            Daylight::Between(rise, set) if rise <= now && now < set => return true,
            Daylight::Between(..) => {}
            other if date == today => polar = Some(other),
            _ => {}
        }
    }
    polar == Some(Daylight::Always)
}

/// Active for `duration` after each start; after a stop, inactive until
/// `interval` has passed.
#[derive(Debug, Clone)]
pub struct TimeScheduler {
    duration: Option<Duration>,
    interval: Option<Duration>,
    started: Option<Duration>,
    stopped: Option<Duration>,
}

impl TimeScheduler {
    pub fn new(duration: Option<Duration>, interval: Option<Duration>) -> Self {
        Self {
            duration,
            interval,
            started: None,
            stopped: None,
        }
    }
}

impl Scheduler for TimeScheduler {
    fn name(&self) -> &'static str {
        "time"
    }

    fn start(&mut self, clock: &dyn Clock) {
        self.started = Some(clock.now());
    }

    fn stop(&mut self, clock: &dyn Clock) {
        self.started = None;
        self.stopped = Some(clock.now());
    }

    fn check(&self, clock: &dyn Clock) -> bool {
        let now = clock.now();
        match self.started {
            Some(started) => self
                .duration
                .map_or(true, |d| now.saturating_sub(started) < d),
            None => match (self.stopped, self.interval) {
                (Some(stopped), Some(interval)) => now.saturating_sub(stopped) >= interval,
                _ => true,
            },
        }
    }
}

/// Active until `max_trials` trials have completed in the current activation.
#[derive(Debug, Clone)]
pub struct CountScheduler {
    max_trials: u32,
    count: u32,
}

impl CountScheduler {
    pub fn new(max_trials: u32) -> Self {
        Self {
            max_trials,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Scheduler for CountScheduler {
    fn name(&self) -> &'static str {
        "count"
    }

    fn stop(&mut self, _clock: &dyn Clock) {
        self.count = 0;
    }

    fn update(&mut self, _trial: &Trial) {
        self.count += 1;
    }

    fn check(&self, _clock: &dyn Clock) -> bool {
        self.count < self.max_trials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::trial::tests::sample_trial;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 6, 1, h, m, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn periods_wrap_midnight() {
        let s = TimeOfDayScheduler::new(Windows::Periods(vec![(
            parse_time_of_day("22:00").unwrap(),
            parse_time_of_day("06:30").unwrap(),
        )]));
        assert!(s.is_active_at(at(23, 15)));
        assert!(s.is_active_at(at(3, 0)));
        assert!(!s.is_active_at(at(6, 30)));
        assert!(!s.is_active_at(at(12, 0)));
    }

    #[test]
    fn bad_time_of_day_is_rejected() {
        assert!(matches!(
            parse_time_of_day("25:99"),
            Err(ConfigError::TimeOfDay(_))
        ));
    }

    #[test]
    fn sun_and_night_are_complements() {
        let loc = Location {
            latitude: 32.88,
            longitude: -117.23,
        };
        let noon_utc = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();
        let midnight_utc = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert!(is_daylight(noon_utc, &loc));
        assert!(!is_daylight(midnight_utc, &loc));

        let sun = TimeOfDayScheduler::new(Windows::Sun(loc.clone()));
        let night = TimeOfDayScheduler::new(Windows::Night(loc));
        let t = noon_utc.with_timezone(&Local);
        assert_ne!(sun.is_active_at(t), night.is_active_at(t));
    }

    #[test]
    fn polar_summer_never_sets() {
        let loc = Location {
            latitude: 78.2,
            longitude: 15.6,
        };
        let t = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        assert!(is_daylight(t, &loc));
    }

    #[test]
    fn time_scheduler_enforces_duration_and_interval() {
        let clock = ManualClock::new();
        let mut s = TimeScheduler::new(
            Some(Duration::from_secs(60)),
            Some(Duration::from_secs(600)),
        );
        assert!(s.check(&clock));
        s.start(&clock);
        clock.advance(Duration::from_secs(59));
        assert!(s.check(&clock));
        clock.advance(Duration::from_secs(1));
        assert!(!s.check(&clock));
        s.stop(&clock);
        clock.advance(Duration::from_secs(599));
        assert!(!s.check(&clock));
        clock.advance(Duration::from_secs(1));
        assert!(s.check(&clock));
    }

    #[test]
    fn count_scheduler_resets_on_stop() {
        let clock = ManualClock::new();
        let mut s = CountScheduler::new(2);
        let trial = sample_trial();
        s.start(&clock);
        s.update(&trial);
        assert!(s.check(&clock));
        s.update(&trial);
        assert!(!s.check(&clock));
        s.stop(&clock);
        assert!(s.check(&clock));
    }

    #[test]
    fn empty_state_is_always_active() {
        let clock = ManualClock::new();
        let mut state = StateSchedulers::default();
        assert!(state.is_active(&clock));
        state.push(CountScheduler::new(0));
        assert!(!state.is_active(&clock));
    }
}
