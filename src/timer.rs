//! Shared timer wheel.
//!
//! Every state machine in the gateway (LAPD T200/T203, Q.931 call timers,
//! NFAS heartbeat and switchover watchdog) schedules against one of these
//! wheels and drains expired entries from its own task loop, so timer
//! firings are ordered with ordinary queue traffic and never preempt.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

pub struct TimerWheel<T> {
    entries: Mutex<BTreeMap<(Instant, u64), T>>,
    next_id: AtomicU64,
}

/// Handle returned by [`TimerWheel::schedule`], used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    deadline: Instant,
    id: u64,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        TimerWheel {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule(&self, after: Duration, value: T) -> TimerId {
        self.schedule_at(Instant::now() + after, value)
    }

    pub fn schedule_at(&self, deadline: Instant, value: T) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((deadline, id), value);
        }
        TimerId { deadline, id }
    }

    pub fn cancel(&self, timer: TimerId) -> Option<T> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut e| e.remove(&(timer.deadline, timer.id)))
    }

    /// Remove and return every entry whose deadline is at or before `now`,
    /// in deadline order.
    pub fn expire(&self, now: Instant) -> Vec<T> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut due = Vec::new();
        while let Some((&key, _)) = entries.first_key_value() {
            if key.0 > now {
                break;
            }
            if let Some(value) = entries.remove(&key) {
                due.push(value);
            }
        }
        due
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_expire() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule_at(now, "t200");
        wheel.schedule_at(now + Duration::from_millis(500), "t203");

        let due = wheel.expire(now + Duration::from_millis(100));
        assert_eq!(due, vec!["t200"]);
        assert_eq!(wheel.len(), 1);

        let due = wheel.expire(now + Duration::from_secs(1));
        assert_eq!(due, vec!["t203"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_cancel() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        let id = wheel.schedule_at(now, "t200");
        assert_eq!(wheel.cancel(id), Some("t200"));
        assert_eq!(wheel.cancel(id), None);
        assert!(wheel.expire(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_expire_preserves_deadline_order() {
        let wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule_at(now + Duration::from_millis(30), 3u32);
        wheel.schedule_at(now + Duration::from_millis(10), 1u32);
        wheel.schedule_at(now + Duration::from_millis(20), 2u32);
        let due = wheel.expire(now + Duration::from_millis(100));
        assert_eq!(due, vec![1, 2, 3]);
    }
}
