use crate::task::TaskContext;
use slab::Slab;
use std::sync::Arc;

/// Something that can be parked on a [`WaitList`] and woken later.
pub(crate) trait Waiter {
    fn wake(&self);
}

/// Identifies one entry of a [`WaitList`].
///
/// Slots are reused, so the key carries the generation the slot had when the
/// entry was appended. A stale key never touches a newer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterKey {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Entry<W> {
    /// `None` once woken. The slot stays allocated until the waiter claims
    /// it with [`WaitList::remove`].
    waiter: Option<W>,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Tasks blocked on one synchronization object.
///
/// Not thread-safe by itself: every primitive keeps its list behind its own
/// short lock and wakes waiters while holding it. An entry leaves the list
/// exactly once, either popped by a waker or unlinked by the waiter itself on
/// timeout or cancellation. Either way the waiter removes its key exactly
/// once afterwards, and learns which of the two happened.
///
/// Wake order is front to back but callers must not rely on it.
#[derive(Debug)]
pub(crate) struct WaitList<W = Arc<TaskContext>> {
    entries: Slab<Entry<W>>,
    head: Option<usize>,
    tail: Option<usize>,
    linked: usize,
    next_generation: u64,
}

impl<W> Default for WaitList<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> WaitList<W> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(),
            head: None,
            tail: None,
            linked: 0,
            next_generation: 0,
        }
    }

    /// Number of waiters not woken yet.
    pub(crate) fn len(&self) -> usize {
        self.linked
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.linked == 0
    }

    /// Number of entries ever appended.
    #[cfg(test)]
    pub(crate) fn appended(&self) -> u64 {
        self.next_generation
    }

    pub(crate) fn append(&mut self, waiter: W) -> WaiterKey {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let index = self.entries.insert(Entry {
            waiter: Some(waiter),
            generation,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.entries[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.linked += 1;

        WaiterKey { index, generation }
    }

    /// Releases the entry behind `key`. Returns `true` if it was still
    /// waiting, `false` if a waker got to it first.
    ///
    /// # Panics
    ///
    /// Panics if the entry was already removed.
    pub(crate) fn remove(&mut self, key: WaiterKey) -> bool {
        let linked = match self.entries.get(key.index) {
            Some(entry) if entry.generation == key.generation => entry.waiter.is_some(),
            _ => panic!("wait list entry {key:?} removed twice"),
        };

        if linked {
            drop(self.unlink(key.index));
        }
        self.entries.remove(key.index);
        linked
    }

    fn pop_front(&mut self) -> Option<W> {
        let head = self.head?;
        self.unlink(head)
    }

    /// Takes the entry at `index` out of the list, leaving its slot behind.
    fn unlink(&mut self, index: usize) -> Option<W> {
        let entry = &mut self.entries[index];
        let (prev, next) = (entry.prev.take(), entry.next.take());
        let waiter = entry.waiter.take();

        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.tail = prev,
        }
        self.linked -= 1;

        waiter
    }
}

impl<W: Waiter> WaitList<W> {
    /// Wakes one waiter. Returns `false` if the list was empty.
    pub(crate) fn wake_one(&mut self) -> bool {
        match self.pop_front() {
            Some(waiter) => {
                waiter.wake();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter and returns how many there were.
    pub(crate) fn wake_all(&mut self) -> usize {
        let mut woken = 0;
        while self.wake_one() {
            woken += 1;
        }
        woken
    }
}
