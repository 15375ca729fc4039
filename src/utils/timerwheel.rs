//! Keyed single-shot timer table owned by the reactor.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use tokio::time::{Duration, Instant};

/// Collection of cancellable single-shot timers, each identified by a key.
/// Scheduling an already-scheduled key replaces its deadline. Firing is
/// pull-based: the owner asks for `expired()` keys at a given instant and
/// sleeps until `next_deadline()` in between.
#[derive(Debug)]
pub struct TimerWheel<K> {
    /// Ordered deadlines; the sequence number breaks ties between keys
    /// scheduled for the same instant.
    deadlines: BTreeMap<(Instant, u64), K>,

    /// Map from key -> its slot in `deadlines`.
    slots: HashMap<K, (Instant, u64)>,

    /// Next tie-breaking sequence number.
    next_seq: u64,
}

impl<K> TimerWheel<K>
where
    K: Clone + Eq + Hash,
{
    /// Creates an empty timer wheel.
    pub fn new() -> Self {
        TimerWheel {
            deadlines: BTreeMap::new(),
            slots: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Schedules `key` to fire `dur` after `now`.
    pub fn schedule(&mut self, key: K, now: Instant, dur: Duration) {
        self.cancel(&key);
        let slot = (now + dur, self.next_seq);
        self.next_seq += 1;
        self.deadlines.insert(slot, key.clone());
        self.slots.insert(key, slot);
    }

    /// Cancels the timer of `key`. Returns whether it was scheduled.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.deadlines.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Whether `key` currently has a pending timer.
    pub fn is_scheduled(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every key whose deadline is at or before `now`,
    /// in deadline order.
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut fired = vec![];
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.slots.remove(&key);
            fired.push(key);
        }
        fired
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K> Default for TimerWheel<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
