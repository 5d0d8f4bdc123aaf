// Keyed table of cancellable timers
//
// Every timer in the messaging core (typing expiry, reconnect backoff,
// circuit reset) lives in one of these tables, owned by the component
// that armed it. Re-arming a key aborts the previous timer. Each firing
// carries the generation it was armed with so the owner can drop a
// firing that lost a race with a cancel or a re-arm.

use log::debug;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TimerTable<K> {
    next_generation: u64,
    entries: HashMap<K, TimerEntry>,
}

impl<K> TimerTable<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            next_generation: 0,
            entries: HashMap::new(),
        }
    }

    /// Arm `key` to run `fire` after `delay`, replacing any timer already
    /// armed under that key. Returns the generation handed to `fire`.
    pub fn arm<F, Fut>(&mut self, key: K, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation).await;
        });
        debug!("Armed timer {:?} (generation {}) for {:?}", key, generation, delay);
        self.entries.insert(key, TimerEntry { generation, handle });
        generation
    }

    /// Abort the timer under `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                debug!("Cancelled timer {:?} (generation {})", key, entry.generation);
                true
            }
            None => false,
        }
    }

    /// Called by the owner when a timer fires. Removes the entry and
    /// returns true only if `generation` is still the armed one.
    pub fn complete(&mut self, key: &K, generation: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }
}

impl<K> Default for TimerTable<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TimerTable<K> {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }
}
