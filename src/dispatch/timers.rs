//! Script timers.
//!
//! The loop asks the timer service for due callbacks before every receive
//! and waits no longer than the time to the next deadline.

use crate::value::Callable;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of timed script callbacks
pub trait TimerService: Send {
    /// Remove and return callbacks whose deadline has passed, earliest first
    fn take_due(&mut self, now: Instant) -> Vec<Callable>;

    /// Milliseconds until the next deadline, capped at `max_wait_ms`
    fn next_wait_ms(&self, now: Instant, max_wait_ms: u32) -> u32;
}

#[derive(Debug, Clone)]
struct Timer {
    due: Instant,
    interval: Option<Duration>,
    callback: Callable,
}

/// `setTimeout` and `setInterval` style timers
#[derive(Debug, Default)]
pub struct ScriptTimers {
    timers: BTreeMap<u32, Timer>,
    next_id: u32,
}

/// Timers shared between the loop, the timer natives and a host thread
pub type SharedTimers = Arc<Mutex<ScriptTimers>>;

/// Most timers a script may hold at once
pub const MAX_TIMERS: usize = 256;

/// Shortest interval period; a zero period would fire on every iteration
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

impl ScriptTimers {
    /// Create an empty timer set
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once after `delay`
    pub fn set_timeout(&mut self, callback: Callable, delay: Duration) -> u32 {
        self.add(callback, delay, None)
    }

    /// Run `callback` every `period`, at least [`MIN_PERIOD`]
    pub fn set_interval(&mut self, callback: Callable, period: Duration) -> u32 {
        let period = period.max(MIN_PERIOD);
        self.add(callback, period, Some(period))
    }

    /// Whether `id` is an interval timer, `None` if it does not exist
    pub fn is_interval(&self, id: u32) -> Option<bool> {
        self.timers.get(&id).map(|t| t.interval.is_some())
    }

    /// Cancel a timer
    pub fn clear(&mut self, id: u32) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Restart a timer's countdown with a new delay
    ///
    /// Interval timers keep their period unless `delay` is non-zero.
    pub fn reset(&mut self, id: u32, delay: Duration) -> bool {
        match self.timers.get_mut(&id) {
            Some(timer) => {
                timer.due = Instant::now() + delay;
                if timer.interval.is_some() && !delay.is_zero() {
                    timer.interval = Some(delay.max(MIN_PERIOD));
                }
                true
            }
            None => false,
        }
    }

    /// Number of live timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are live
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn add(&mut self, callback: Callable, delay: Duration, interval: Option<Duration>) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        self.timers.insert(
            id,
            Timer {
                due: Instant::now() + delay,
                interval,
                callback,
            },
        );
        tracing::trace!(id, delay_ms = delay.as_millis() as u64, "Timer added");
        id
    }
}

impl TimerService for ScriptTimers {
    fn take_due(&mut self, now: Instant) -> Vec<Callable> {
        let mut due: Vec<(Instant, u32)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.due <= now)
            .map(|(id, t)| (t.due, *id))
            .collect();
        due.sort();

        let mut callbacks = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(timer) = self.timers.get_mut(&id) else {
                continue;
            };
            callbacks.push(timer.callback);
            match timer.interval {
                Some(period) => {
                    timer.due += period;
                    if timer.due <= now {
                        timer.due = now + period;
                    }
                }
                None => {
                    self.timers.remove(&id);
                }
            }
        }
        callbacks
    }

    fn next_wait_ms(&self, now: Instant, max_wait_ms: u32) -> u32 {
        self.timers
            .values()
            .map(|t| t.due.saturating_duration_since(now).as_millis())
            .min()
            .map(|ms| ms.min(max_wait_ms as u128) as u32)
            .unwrap_or(max_wait_ms)
    }
}

impl TimerService for SharedTimers {
    fn take_due(&mut self, now: Instant) -> Vec<Callable> {
        self.lock().take_due(now)
    }

    fn next_wait_ms(&self, now: Instant, max_wait_ms: u32) -> u32 {
        self.lock().next_wait_ms(now, max_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_timers() -> (ScriptTimers, Instant) {
        (ScriptTimers::new(), Instant::now())
    }

    #[test]
    fn test_timeout_fires_once() {
        let (mut timers, start) = create_timers();
        let id = timers.set_timeout(Callable::Script(1), Duration::from_millis(100));
        assert!(id > 0);

        assert!(timers.take_due(start).is_empty());
        let due = timers.take_due(start + Duration::from_secs(1));
        assert_eq!(due, vec![Callable::Script(1)]);
        assert!(timers.is_empty());
        assert!(timers.take_due(start + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_interval_repeats() {
        let (mut timers, start) = create_timers();
        timers.set_interval(Callable::Script(2), Duration::from_millis(50));

        assert_eq!(timers.take_due(start + Duration::from_secs(1)).len(), 1);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.take_due(start + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let (mut timers, start) = create_timers();
        let id = timers.set_interval(Callable::Script(3), Duration::ZERO);
        assert_eq!(timers.is_interval(id), Some(true));

        let now = start + Duration::from_millis(10);
        assert_eq!(timers.take_due(now).len(), 1);
        // rescheduled strictly after `now`, so the same instant yields nothing
        assert!(timers.take_due(now).is_empty());
        assert!(timers.next_wait_ms(now, 1000) >= 1);
    }

    #[test]
    fn test_due_order() {
        let (mut timers, start) = create_timers();
        timers.set_timeout(Callable::Script(2), Duration::from_millis(200));
        timers.set_timeout(Callable::Script(1), Duration::from_millis(10));

        let due = timers.take_due(start + Duration::from_secs(1));
        assert_eq!(due, vec![Callable::Script(1), Callable::Script(2)]);
    }

    #[test]
    fn test_clear_and_reset() {
        let (mut timers, start) = create_timers();
        let id = timers.set_timeout(Callable::Script(1), Duration::from_millis(10));
        assert!(timers.reset(id, Duration::from_secs(3600)));
        assert!(timers.take_due(start + Duration::from_secs(1)).is_empty());

        assert!(timers.clear(id));
        assert!(!timers.clear(id));
        assert!(!timers.reset(id, Duration::ZERO));
    }

    #[test]
    fn test_next_wait() {
        let (mut timers, start) = create_timers();
        assert_eq!(timers.next_wait_ms(start, 1000), 1000);

        timers.set_timeout(Callable::Script(1), Duration::from_secs(3600));
        assert_eq!(timers.next_wait_ms(start, 1000), 1000);

        timers.set_timeout(Callable::Script(2), Duration::ZERO);
        assert_eq!(timers.next_wait_ms(start + Duration::from_millis(5), 1000), 0);
    }

    #[test]
    fn test_shared_timers() {
        let shared: SharedTimers = Arc::new(Mutex::new(ScriptTimers::new()));
        let mut service: Box<dyn TimerService> = Box::new(shared.clone());
        shared.lock().set_timeout(Callable::Script(7), Duration::ZERO);

        let due = service.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due, vec![Callable::Script(7)]);
        assert!(shared.lock().is_empty());
    }
}
