// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event manager (timer wheel) collaborator, spec.md §6.
//!
//! `DataLink`'s retransmit timers and `Port0`'s periodic work are driven
//! through this trait rather than spawning their own threads, matching
//! the "reentrant fsm_event with queue" and "scoped resources" design
//! notes in spec.md §9: scheduling is a cooperative pump the host drives.

use crate::time::Timestamp;

/// Opaque handle to a scheduled event. `0` is reserved to mean "schedule
/// failed" (spec.md §6: `schedule(...) -> event_id | 0`).
pub type EventId = u64;

/// Timer-wheel / scheduler collaborator.
pub trait EventManager {
    /// Schedule `callback` to fire at `timestamp`. Returns `0` if the
    /// event manager has no room left for another timer.
    fn schedule(&mut self, timestamp: Timestamp, callback: EventCallback) -> EventId;

    /// Cancel a previously scheduled event. `Ok(())` even if it already
    /// fired; `Err` only if the id was never valid.
    fn cancel(&mut self, event_id: EventId) -> Result<(), ()>;

    /// Current time as seen by the event manager.
    fn timestamp(&self) -> Timestamp;

    /// Ticks until the next scheduled event, or `i64::MAX` if none.
    fn interval_next(&self, now: Timestamp) -> i64;

    /// Run every event whose deadline is `<= now`. Returns the count run.
    fn process(&mut self, now: Timestamp) -> usize;
}

/// Boxed callback invoked when a scheduled event fires.
pub type EventCallback = Box<dyn FnMut(Timestamp) + Send>;

struct ScheduledEvent {
    id: EventId,
    deadline: Timestamp,
    callback: EventCallback,
}

/// A simple `Vec`-backed [`EventManager`] for tests and for hosts that
/// don't already have their own scheduler. Not a production timer wheel
/// (linear scan on every `process`), but it implements the exact contract
/// spec.md §6 names, which is all `DataLink`/`Port0` depend on.
#[derive(Default)]
pub struct ManualEventManager {
    events: Vec<ScheduledEvent>,
    next_id: EventId,
    now: Timestamp,
}

impl ManualEventManager {
    /// Create an empty event manager starting at [`Timestamp::ZERO`].
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            now: Timestamp::ZERO,
        }
    }
}

impl EventManager for ManualEventManager {
    fn schedule(&mut self, timestamp: Timestamp, callback: EventCallback) -> EventId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.events.push(ScheduledEvent {
            id,
            deadline: timestamp,
            callback,
        });
        id
    }

    fn cancel(&mut self, event_id: EventId) -> Result<(), ()> {
        let before = self.events.len();
        self.events.retain(|e| e.id != event_id);
        if self.events.len() < before {
            Ok(())
        } else {
            Err(())
        }
    }

    fn timestamp(&self) -> Timestamp {
        self.now
    }

    fn interval_next(&self, now: Timestamp) -> i64 {
        self.events
            .iter()
            .map(|e| e.deadline.sub(now))
            .filter(|&d| d >= 0)
            .min()
            .unwrap_or(i64::MAX)
    }

    fn process(&mut self, now: Timestamp) -> usize {
        self.now = now;
        let mut due: Vec<ScheduledEvent> = Vec::new();
        let mut pending = Vec::new();
        for event in self.events.drain(..) {
            if event.deadline.sub(now) <= 0 {
                due.push(event);
            } else {
                pending.push(event);
            }
        }
        self.events = pending;
        let count = due.len();
        for mut event in due {
            (event.callback)(now);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_due_events_in_process() {
        let mut mgr = ManualEventManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = mgr.schedule(
            Timestamp::ZERO.add_millis(10),
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_ne!(id, 0);

        assert_eq!(mgr.process(Timestamp::ZERO.add_millis(5)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert_eq!(mgr.process(Timestamp::ZERO.add_millis(10)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut mgr = ManualEventManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = mgr.schedule(
            Timestamp::ZERO.add_millis(10),
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(mgr.cancel(id).is_ok());
        mgr.process(Timestamp::ZERO.add_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn interval_next_is_infinite_with_no_events() {
        let mgr = ManualEventManager::new();
        assert_eq!(mgr.interval_next(Timestamp::ZERO), i64::MAX);
    }
}
