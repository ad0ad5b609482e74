//! Tumbling window controller.
//!
//! Decides per event whether the current window must close. All state is
//! atomic so every execution context can call [`WindowController::advance`]
//! concurrently; only the context that wins the flush calls `reset`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Start-time value meaning "no event seen yet". Zero is a valid timestamp.
const UNSET: u64 = u64::MAX;

/// When a window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Close once `interval_ns` has elapsed since the window start.
    Time { interval_ns: u64 },
    /// Close after `size` events.
    Count { size: u64 },
    /// Close when the gap since the previous event reaches `gap_ns`.
    Session { gap_ns: u64 },
}

impl WindowPolicy {
    pub fn time(interval: Duration) -> Self {
        Self::Time {
            interval_ns: duration_ns(interval),
        }
    }

    pub fn session(gap: Duration) -> Self {
        Self::Session {
            gap_ns: duration_ns(gap),
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Window state shared by all execution contexts.
pub struct WindowController {
    policy: WindowPolicy,
    start_time: AtomicU64,
    /// Events observed since the last reset (count policy).
    events: AtomicU64,
    /// Latest timestamp observed (session policy).
    last_seen: AtomicU64,
    /// Number of resets; lets a flusher detect that another context already
    /// closed the window it observed.
    generation: AtomicU64,
}

impl WindowController {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            start_time: AtomicU64::new(UNSET),
            events: AtomicU64::new(0),
            last_seen: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Start of the current window, or `None` before the first event.
    pub fn start_time(&self) -> Option<u64> {
        match self.start_time.load(Ordering::Acquire) {
            UNSET => None,
            t => Some(t),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns true when the event at `t` closes the current window.
    ///
    /// The first call initializes the window and always returns false.
    #[inline]
    pub fn advance(&self, t: u64) -> bool {
        let start = match self.start_time.load(Ordering::Acquire) {
            UNSET => match self
                .start_time
                .compare_exchange(UNSET, t, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.events.fetch_add(1, Ordering::AcqRel);
                    self.last_seen.fetch_max(t, Ordering::AcqRel);
                    return false;
                }
                Err(current) => current,
            },
            start => start,
        };

        match self.policy {
            WindowPolicy::Time { interval_ns } => t.saturating_sub(start) >= interval_ns,
            WindowPolicy::Count { size } => self.events.fetch_add(1, Ordering::AcqRel) >= size,
            WindowPolicy::Session { gap_ns } => {
                let prev = self.last_seen.fetch_max(t, Ordering::AcqRel);
                t.saturating_sub(prev) >= gap_ns
            }
        }
    }

    /// Starts a new window at `t`. The event at `t` belongs to the new window.
    pub fn reset(&self, t: u64) {
        self.start_time.store(t, Ordering::Release);
        self.events.store(1, Ordering::Release);
        self.last_seen.fetch_max(t, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
