//! Timer bookkeeping behind a reactor, driven by a timerfd.
//!
//! Two ordered indices hold the same logical entries: one sorted by
//! expiration to harvest everything due, one sorted by sequence to locate an
//! entry for cancellation. They are equal-sized at every observable point.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::sys;
use crate::timestamp::Timestamp;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies a scheduled timer for cancellation.
///
/// Sequence numbers are process-unique and never reused, so a stale handle
/// can never cancel a timer it does not name.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct TimerHandle {
    sequence: u64,
}

impl TimerHandle {
    pub(crate) fn allocate() -> Self {
        TimerHandle {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn sequence(self) -> u64 { self.sequence }
}

pub(crate) struct TimerEntry {
    expiration: Cell<Timestamp>,
    interval: Duration,
    repeat: bool,
    sequence: u64,
    callback: RefCell<Box<dyn FnMut() + Send>>,
}

impl TimerEntry {
    pub(crate) fn new(
        handle: TimerHandle,
        expiration: Timestamp,
        interval: Duration,
        repeat: bool,
        callback: Box<dyn FnMut() + Send>,
    ) -> Rc<Self> {
        Rc::new(TimerEntry {
            expiration: Cell::new(expiration),
            interval,
            repeat,
            sequence: handle.sequence(),
            callback: RefCell::new(callback),
        })
    }

    pub(crate) fn run(&self) { (self.callback.borrow_mut())() }

    fn expiration(&self) -> Timestamp { self.expiration.get() }

    /// Advances a periodic entry. The next expiration is computed from `now`
    /// rather than from the previous expiration, so a long-running handler
    /// does not accumulate drift into a burst of back-to-back fires.
    fn restart(&self, now: Timestamp) { self.expiration.set(now + self.interval) }
}

pub(crate) struct TimerQueue {
    timerfd: RawFd,
    /// Entries ordered by (expiration, sequence).
    timers: BTreeMap<(Timestamp, u64), Rc<TimerEntry>>,
    /// The same entries ordered by sequence.
    active: BTreeMap<u64, Rc<TimerEntry>>,
    calling_expired: bool,
    /// Sequences cancelled while their callback round was in flight; their
    /// periodic entries must not be re-inserted by [`Self::reschedule`].
    cancelled_in_fire: BTreeSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            timerfd: sys::create_timerfd(),
            timers: empty!(),
            active: empty!(),
            calling_expired: false,
            cancelled_in_fire: empty!(),
        }
    }

    pub(crate) fn timerfd(&self) -> RawFd { self.timerfd }

    /// Inserts the entry into both indices; rearms the descriptor when the
    /// earliest expiration moved forward.
    pub(crate) fn add(&mut self, entry: Rc<TimerEntry>) {
        let expiration = entry.expiration();
        if self.insert(entry) {
            sys::reset_timerfd(self.timerfd, expiration);
        }
    }

    pub(crate) fn cancel(&mut self, sequence: u64) {
        self.assert_indices_in_sync();
        if let Some(entry) = self.active.remove(&sequence) {
            self.timers
                .remove(&(entry.expiration(), sequence))
                .expect("timer present in the active index but not the expiration index");
        } else if self.calling_expired {
            // The entry is out of both indices while its round runs; remember
            // the cancellation so reschedule() drops it instead of re-arming.
            self.cancelled_in_fire.insert(sequence);
        }
        self.assert_indices_in_sync();
    }

    /// First half of the fire protocol: consume the descriptor's expiration
    /// count and move every due entry out of both indices, in expiration
    /// order.
    pub(crate) fn expire(&mut self, now: Timestamp) -> Vec<Rc<TimerEntry>> {
        self.assert_indices_in_sync();
        sys::read_timerfd(self.timerfd, now);

        let mut expired = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }
        for entry in &expired {
            self.active
                .remove(&entry.sequence)
                .expect("timer present in the expiration index but not the active index");
        }
        self.assert_indices_in_sync();

        self.calling_expired = true;
        self.cancelled_in_fire.clear();
        expired
    }

    /// Second half of the fire protocol: re-insert surviving periodic
    /// entries and rearm the descriptor to the new earliest expiration.
    pub(crate) fn reschedule(&mut self, expired: Vec<Rc<TimerEntry>>, now: Timestamp) {
        for entry in expired {
            if entry.repeat && !self.cancelled_in_fire.contains(&entry.sequence) {
                entry.restart(now);
                self.insert(entry);
            }
        }
        self.calling_expired = false;

        if let Some((&(expiration, _), _)) = self.timers.first_key_value() {
            sys::reset_timerfd(self.timerfd, expiration);
        }
    }

    /// Returns whether the inserted entry became the earliest.
    fn insert(&mut self, entry: Rc<TimerEntry>) -> bool {
        self.assert_indices_in_sync();
        let expiration = entry.expiration();
        let earliest_changed = match self.timers.first_key_value() {
            None => true,
            Some((&(first, _), _)) => expiration < first,
        };
        let replaced = self
            .timers
            .insert((expiration, entry.sequence), entry.clone());
        assert!(replaced.is_none());
        let replaced = self.active.insert(entry.sequence, entry);
        assert!(replaced.is_none());
        self.assert_indices_in_sync();
        earliest_changed
    }

    fn assert_indices_in_sync(&self) {
        assert_eq!(self.timers.len(), self.active.len());
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) { sys::close_fd(self.timerfd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(handle: TimerHandle, when: Timestamp, interval: Duration) -> Rc<TimerEntry> {
        TimerEntry::new(handle, when, interval, !interval.is_zero(), Box::new(|| {}))
    }

    #[test]
    fn indices_stay_in_sync_across_add_and_cancel() {
        let mut queue = TimerQueue::new();
        let now = Timestamp::now();
        let one_shot = TimerHandle::allocate();
        let periodic = TimerHandle::allocate();
        queue.add(entry(one_shot, now + Duration::from_millis(5), Duration::ZERO));
        queue.add(entry(periodic, now + Duration::from_millis(50), Duration::from_millis(50)));
        assert_eq!(queue.timers.len(), 2);
        assert_eq!(queue.active.len(), 2);

        queue.cancel(one_shot.sequence());
        assert_eq!(queue.timers.len(), 1);
        assert_eq!(queue.active.len(), 1);

        // Cancelling an unknown sequence outside a fire round is a no-op.
        queue.cancel(TimerHandle::allocate().sequence());
        assert_eq!(queue.timers.len(), 1);
    }

    #[test]
    fn cancel_during_fire_blocks_periodic_reinsertion() {
        let mut queue = TimerQueue::new();
        let now = Timestamp::now();
        let periodic = TimerHandle::allocate();
        queue.add(entry(periodic, now + Duration::from_millis(1), Duration::from_millis(10)));

        let expired = queue.expire(now + Duration::from_millis(5));
        assert_eq!(expired.len(), 1);
        assert!(queue.timers.is_empty());

        queue.cancel(periodic.sequence());
        queue.reschedule(expired, now + Duration::from_millis(5));
        assert!(queue.timers.is_empty());
        assert!(queue.active.is_empty());
    }

    #[test]
    fn surviving_periodic_entry_is_rearmed_from_now() {
        let mut queue = TimerQueue::new();
        let now = Timestamp::now();
        let periodic = TimerHandle::allocate();
        queue.add(entry(periodic, now + Duration::from_millis(1), Duration::from_millis(10)));

        let fire_time = now + Duration::from_millis(25);
        let expired = queue.expire(fire_time);
        assert_eq!(expired.len(), 1);
        queue.reschedule(expired, fire_time);
        assert_eq!(queue.timers.len(), 1);
        let (&(when, _), _) = queue.timers.first_key_value().unwrap();
        // Drift-free restart: next expiration counts from the fire time.
        assert_eq!(when, fire_time + Duration::from_millis(10));
    }
}
