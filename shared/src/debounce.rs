//! Trailing-edge debounce keyed by an arbitrary key.
//!
//! The debouncer never owns a timer. Callers ask for [`Debouncer::next_deadline`],
//! sleep until then, and collect whatever is due with [`Debouncer::take_due`].
//! At most one value per key is in flight; a value scheduled while its key is
//! in flight fires once the in-flight one is completed and its window elapsed.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Pending<V> {
    value: V,
    due: Instant,
}

#[derive(Debug)]
struct Slot<V> {
    pending: Option<Pending<V>>,
    in_flight: Option<V>,
}

#[derive(Debug)]
pub struct Debouncer<K, V> {
    window: Duration,
    slots: HashMap<K, Slot<V>>,
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: HashMap::new(),
        }
    }

    /// Replaces any pending value for `key` and restarts its window.
    pub fn schedule(&mut self, key: K, value: V, now: Instant) {
        let due = now + self.window;
        let slot = self.slots.entry(key).or_insert(Slot {
            pending: None,
            in_flight: None,
        });
        slot.pending = Some(Pending { value, due });
    }

    /// Earliest instant at which [`take_due`](Self::take_due) will yield something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| slot.in_flight.is_none())
            .filter_map(|slot| slot.pending.as_ref().map(|p| p.due))
            .min()
    }

    /// Moves every due value whose key is idle into flight, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut due: Vec<(Instant, K, V)> = Vec::new();
        for (key, slot) in &mut self.slots {
            if slot.in_flight.is_some() {
                continue;
            }
            if slot.pending.as_ref().is_some_and(|p| p.due <= now) {
                if let Some(pending) = slot.pending.take() {
                    slot.in_flight = Some(pending.value.clone());
                    due.push((pending.due, key.clone(), pending.value));
                }
            }
        }
        due.sort_by_key(|(at, _, _)| *at);
        due.into_iter().map(|(_, key, value)| (key, value)).collect()
    }

    /// Marks the in-flight value of `key` as finished and returns it.
    pub fn complete(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.get_mut(key)?;
        let finished = slot.in_flight.take();
        if slot.pending.is_none() {
            self.slots.remove(key);
        }
        finished
    }

    /// Latest value for `key` that has not been completed yet.
    pub fn latest(&self, key: &K) -> Option<&V> {
        let slot = self.slots.get(key)?;
        slot.pending
            .as_ref()
            .map(|p| &p.value)
            .or(slot.in_flight.as_ref())
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.slots.get(key).is_some_and(|s| s.in_flight.is_some())
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.get(key).is_some_and(|s| s.pending.is_some())
    }

    /// Drops pending (not yet fired) values for every key matching `pred`.
    /// In-flight values are left to complete.
    pub fn discard_pending(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let mut dropped = 0;
        self.slots.retain(|key, slot| {
            if pred(key) && slot.pending.take().is_some() {
                dropped += 1;
            }
            slot.pending.is_some() || slot.in_flight.is_some()
        });
        dropped
    }

    pub fn iter_latest(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|(key, slot)| {
            slot.pending
                .as_ref()
                .map(|p| &p.value)
                .or(slot.in_flight.as_ref())
                .map(|v| (key, v))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
