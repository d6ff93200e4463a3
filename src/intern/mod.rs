//! # Interning
//!
//! [`WeakSet`] keeps one canonical copy of each distinct value for as long as anyone
//! holds on to it, without keeping it alive itself.
//!
//! Every value handed out is an `Arc<Interned<T>>`. When the last strong reference is
//! dropped, the value posts its hash to the set's reference queue, and the dead
//! entry is swept out at the start of the next operation on the set.

use std::{
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    ops::Deref,
    sync::{Arc, Weak},
};

#[cfg(test)]
mod test;

const MIN_CAPACITY: usize = 16;

/// A value owned by a [`WeakSet`]
pub struct Interned<T> {
    value: T,
    hash: u64,
    queue: flume::Sender<u64>,
}

impl<T> Deref for Interned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Interned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: fmt::Display> fmt::Display for Interned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T> Drop for Interned<T> {
    fn drop(&mut self) {
        // the set may be gone already, in which case there is nothing to clean up
        let _ = self.queue.send(self.hash);
    }
}

struct Entry<T> {
    hash: u64,
    value: Weak<Interned<T>>,
}

/// Hash set of weakly held, canonical values.
///
/// Open addressing with linear probing. The table doubles once it would be more
/// than 1/1.75 full, and removal shifts the rest of the probe run back instead of
/// leaving tombstones.
pub struct WeakSet<T> {
    slots: Vec<Option<Entry<T>>>,
    len: usize,
    hasher: RandomState,
    queue_tx: flume::Sender<u64>,
    queue_rx: flume::Receiver<u64>,
}

impl<T: Hash + Eq> Default for WeakSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Hash + Eq> WeakSet<T> {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            len: 0,
            hasher: RandomState::new(),
            queue_tx,
            queue_rx,
        }
    }

    /// number of entries, including dead ones that have not been swept yet
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn home(&self, hash: u64) -> usize {
        hash as usize & self.mask()
    }

    /// The canonical copy of `value`, adding it if there is none
    pub fn add(&mut self, value: T) -> Arc<Interned<T>> {
        self.sweep();
        let hash = self.hasher.hash_one(&value);
        if let Some(existing) = self.lookup(&value, hash) {
            return existing.1;
        }
        if (self.len + 1) * 7 > self.capacity() * 4 {
            self.resize(self.capacity() * 2);
        }
        let interned = Arc::new(Interned {
            value,
            hash,
            queue: self.queue_tx.clone(),
        });
        let mut i = self.home(hash);
        while self.slots[i].is_some() {
            i = (i + 1) & self.mask();
        }
        self.slots[i] = Some(Entry {
            hash,
            value: Arc::downgrade(&interned),
        });
        self.len += 1;
        interned
    }

    pub fn get(&mut self, value: &T) -> Option<Arc<Interned<T>>> {
        self.sweep();
        let hash = self.hasher.hash_one(value);
        self.lookup(value, hash).map(|(_, v)| v)
    }

    pub fn contains(&mut self, value: &T) -> bool {
        self.get(value).is_some()
    }

    /// Drop `value` from the set. Outstanding references stay valid, but are no
    /// longer canonical.
    pub fn remove(&mut self, value: &T) -> Option<Arc<Interned<T>>> {
        self.sweep();
        let hash = self.hasher.hash_one(value);
        let (slot, found) = self.lookup(value, hash)?;
        self.slots[slot] = None;
        self.len -= 1;
        self.resize(self.capacity());
        Some(found)
    }

    /// slot and live value equal to `value`
    fn lookup(&self, value: &T, hash: u64) -> Option<(usize, Arc<Interned<T>>)> {
        let mut i = self.home(hash);
        while let Some(entry) = &self.slots[i] {
            if entry.hash == hash {
                if let Some(live) = entry.value.upgrade() {
                    if live.value == *value {
                        return Some((i, live));
                    }
                }
            }
            i = (i + 1) & self.mask();
        }
        None
    }

    /// rehash every entry into a table of `capacity` slots, dropping dead ones
    fn resize(&mut self, capacity: usize) {
        trace!("rehashing weak set ({} entries) to capacity {capacity}", self.len);
        let old = std::mem::replace(
            &mut self.slots,
            std::iter::repeat_with(|| None).take(capacity).collect(),
        );
        self.len = 0;
        for entry in old.into_iter().flatten() {
            if entry.value.strong_count() == 0 {
                continue;
            }
            let mut i = self.home(entry.hash);
            while self.slots[i].is_some() {
                i = (i + 1) & self.mask();
            }
            self.slots[i] = Some(entry);
            self.len += 1;
        }
    }

    /// process the reference queue
    fn sweep(&mut self) {
        let mut swept = 0;
        while let Ok(hash) = self.queue_rx.try_recv() {
            swept += self.sweep_hash(hash);
        }
        if swept > 0 {
            trace!("swept {swept} dead entries from weak set");
        }
    }

    fn sweep_hash(&mut self, hash: u64) -> usize {
        let mut removed = 0;
        let mut i = self.home(hash);
        while let Some(entry) = &self.slots[i] {
            if entry.hash == hash && entry.value.strong_count() == 0 {
                // slot `i` is refilled from further along the run, check it again
                self.remove_slot(i);
                removed += 1;
                continue;
            }
            i = (i + 1) & self.mask();
        }
        removed
    }

    /// empty slot `hole`, shifting later entries of the probe run back into it
    fn remove_slot(&mut self, mut hole: usize) {
        self.slots[hole] = None;
        self.len -= 1;
        let mask = self.mask();
        let mut i = hole;
        loop {
            i = (i + 1) & mask;
            let Some(entry) = &self.slots[i] else {
                break;
            };
            let home = self.home(entry.hash);
            // an entry can stay if its home lies cyclically in (hole, i]
            let stays = if hole <= i {
                hole < home && home <= i
            } else {
                hole < home || home <= i
            };
            if !stays {
                self.slots[hole] = self.slots[i].take();
                hole = i;
            }
        }
    }
}

impl<T> fmt::Debug for WeakSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSet")
            .field("len", &self.len)
            .field("capacity", &self.slots.len())
            .finish()
    }
}
