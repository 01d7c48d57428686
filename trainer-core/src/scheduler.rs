//! # Timer Scheduler
//!
//! Deadline queue for control-side timers. Each registration returns a
//! [`TimerHandle`]; cancelling a handle guarantees its event is never
//! returned by [`Scheduler::pop_due`], so a stale timer cannot fire after the
//! state it belonged to has moved on.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

/// Cancellation token for one scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug)]
pub struct Scheduler<E> {
    queue: BinaryHeap<Reverse<(Duration, u64)>>,
    pending: HashMap<u64, E>,
    next_id: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers `event` to fire `delay` after `now`.
    pub fn schedule(&mut self, now: Duration, delay: Duration, event: E) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(Reverse((now + delay, id)));
        self.pending.insert(id, event);
        TimerHandle(id)
    }

    /// Cancels a timer. Returns the event if it had not fired yet.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<E> {
        self.pending.remove(&handle.0)
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.queue.clear();
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.queue.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Removes and returns the earliest timer due at or before `now`.
    /// Timers with equal deadlines fire in registration order.
    pub fn pop_due(&mut self, now: Duration) -> Option<(TimerHandle, Duration, E)> {
        self.discard_cancelled();
        let Reverse((deadline, id)) = *self.queue.peek()?;
        if deadline > now {
            return None;
        }
        self.queue.pop();
        let event = self.pending.remove(&id)?;
        Some((TimerHandle(id), deadline, event))
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.queue.peek() {
            if self.pending.contains_key(id) {
                break;
            }
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(0), ms(300), "late");
        scheduler.schedule(ms(0), ms(100), "early");
        scheduler.schedule(ms(50), ms(50), "tied");

        assert_eq!(scheduler.next_deadline(), Some(ms(100)));
        assert!(scheduler.pop_due(ms(99)).is_none());

        let fired: Vec<_> = std::iter::from_fn(|| scheduler.pop_due(ms(1000)))
            .map(|(_, _, event)| event)
            .collect();
        assert_eq!(fired, vec!["early", "tied", "late"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut scheduler = Scheduler::new();
        let stale = scheduler.schedule(ms(0), ms(10), 1);
        let live = scheduler.schedule(ms(0), ms(20), 2);
        assert_eq!(scheduler.cancel(stale), Some(1));
        assert_eq!(scheduler.cancel(stale), None);

        assert_eq!(scheduler.next_deadline(), Some(ms(20)));
        let (handle, deadline, event) = scheduler.pop_due(ms(30)).unwrap();
        assert_eq!((handle, deadline, event), (live, ms(20), 2));
        assert!(!scheduler.is_pending(live));
        assert!(scheduler.pop_due(ms(30)).is_none());
    }

    #[test]
    fn cancel_all_clears_queue() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(ms(0), ms(5), ());
        scheduler.schedule(ms(0), ms(6), ());
        scheduler.cancel_all();
        assert_eq!(scheduler.next_deadline(), None);
        assert_eq!(scheduler.len(), 0);
    }
}
