//! Retransmission timer pool.
//!
//! The connection does not arm one timer per segment. It asks the pool for a
//! wakeup at the soonest deadline it knows about, and the pool only registers
//! it when it is meaningfully earlier than what is already pending. When any
//! timer fires, the connection re-derives everything that is due.

use std::time::Instant;

/// Opaque handle for a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Bounded, coalescing set of pending deadlines.
#[derive(Debug, Clone)]
pub struct TimerManager {
    pending: Vec<(TimerId, Instant)>,
    next_id: u64,
    max_timers: usize,
    reduction: f64,
}

impl TimerManager {
    /// Create an empty pool.
    pub fn new(max_timers: usize, reduction: f64) -> Self {
        Self {
            pending: Vec::with_capacity(max_timers),
            next_id: 0,
            max_timers,
            reduction,
        }
    }

    /// Request a wakeup at `deadline`.
    ///
    /// Returns the id of the new timer, or `None` when the pending timers are
    /// trusted to fire early enough (or the pool is full).
    pub fn schedule(&mut self, now: Instant, deadline: Instant) -> Option<TimerId> {
        if self.pending.len() >= self.max_timers {
            return None;
        }

        if let Some(earliest) = self.next_deadline() {
            let remaining = earliest.saturating_duration_since(now);
            let delay = deadline.saturating_duration_since(now);
            if delay >= remaining.mul_f64(self.reduction) {
                return None;
            }
        }

        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.pending.push((id, deadline));
        Some(id)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|&(_, at)| at).min()
    }

    /// Prune every timer whose deadline has passed. Returns how many fired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|&(_, at)| at > now);
        before - self.pending.len()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop all pending timers.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_timer_always_registered() {
        let now = Instant::now();
        let mut timers = TimerManager::new(8, 0.75);
        assert!(timers.schedule(now, now + ms(1000)).is_some());
        assert_eq!(timers.next_deadline(), Some(now + ms(1000)));
    }

    #[test]
    fn test_coalescing() {
        let now = Instant::now();
        let mut timers = TimerManager::new(8, 0.75);
        timers.schedule(now, now + ms(1000));

        // Later, equal, or only slightly sooner: trust the pending timer.
        assert!(timers.schedule(now, now + ms(2000)).is_none());
        assert!(timers.schedule(now, now + ms(1000)).is_none());
        assert!(timers.schedule(now, now + ms(800)).is_none());

        // Meaningfully sooner.
        assert!(timers.schedule(now, now + ms(700)).is_some());
        assert_eq!(timers.len(), 2);
        assert_eq!(timers.next_deadline(), Some(now + ms(700)));
    }

    #[test]
    fn test_cap() {
        let now = Instant::now();
        let mut timers = TimerManager::new(2, 0.75);
        assert!(timers.schedule(now, now + ms(1000)).is_some());
        assert!(timers.schedule(now, now + ms(500)).is_some());
        assert!(timers.schedule(now, now + ms(10)).is_none());
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn test_expire_prunes_only_due() {
        let now = Instant::now();
        let mut timers = TimerManager::new(8, 0.75);
        timers.schedule(now, now + ms(1000));
        timers.schedule(now, now + ms(300));

        assert_eq!(timers.expire(now + ms(299)), 0);
        assert_eq!(timers.expire(now + ms(300)), 1);
        assert_eq!(timers.next_deadline(), Some(now + ms(1000)));
        assert_eq!(timers.expire(now + ms(5000)), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_overdue_pending_blocks_new_timers() {
        // A pending timer that is already due fires immediately; nothing can
        // beat it.
        let now = Instant::now();
        let mut timers = TimerManager::new(8, 0.75);
        timers.schedule(now, now + ms(100));
        let later = now + ms(200);
        assert!(timers.schedule(later, later + ms(1)).is_none());
    }
}
