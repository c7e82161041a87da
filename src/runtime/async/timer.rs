//! Deadline heap for loop timers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Repeating timers never fire more often than this.
const MIN_REPEAT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

pub type TimerHandler<C> = Box<dyn FnMut(&mut C)>;

struct TimerEntry {
    at: Instant,
    seq: u64,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: the heap pops the earliest deadline, then the oldest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Slot<C> {
    /// Taken out while the handler runs.
    handler: Option<TimerHandler<C>>,
    repeat: Option<Duration>,
    at: Instant,
}

/// Timers keyed by id. Cancellation removes the slot; the heap entry is
/// discarded lazily when it reaches the top.
pub struct Timers<C> {
    heap: BinaryHeap<TimerEntry>,
    slots: HashMap<TimerId, Slot<C>>,
    next_id: u64,
    seq: u64,
}

impl<C> Timers<C> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            next_id: 1,
            seq: 0,
        }
    }

    /// Number of live timers, including one whose handler is running.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&mut self, after: Duration, repeat: Option<Duration>, handler: TimerHandler<C>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let at = Instant::now() + after;
        self.slots.insert(
            id,
            Slot {
                handler: Some(handler),
                repeat,
                at,
            },
        );
        self.schedule(id, at);
        id
    }

    fn schedule(&mut self, id: TimerId, at: Instant) {
        self.seq += 1;
        self.heap.push(TimerEntry { at, seq: self.seq, id });
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.slots.remove(&id).is_some()
    }

    fn is_current(&self, entry: &TimerEntry) -> bool {
        self.slots
            .get(&entry.id)
            .is_some_and(|slot| slot.at == entry.at && slot.handler.is_some())
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.is_current(entry) {
                return Some(entry.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Take the handler of the next timer due at `now`. The caller runs it and
    /// hands it back through [`Timers::finish`].
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerHandler<C>)> {
        let at = self.next_deadline()?;
        if at > now {
            return None;
        }
        let entry = self.heap.pop()?;
        let handler = self.slots.get_mut(&entry.id)?.handler.take()?;
        Some((entry.id, handler))
    }

    /// Return a handler after it ran: repeating timers are rescheduled,
    /// one-shot and cancelled timers are dropped.
    pub fn finish(&mut self, id: TimerId, handler: TimerHandler<C>) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        match slot.repeat {
            Some(repeat) => {
                let at = Instant::now() + repeat.max(MIN_REPEAT);
                slot.at = at;
                slot.handler = Some(handler);
                self.schedule(id, at);
            }
            None => {
                self.slots.remove(&id);
            }
        }
    }
}

impl<C> Default for Timers<C> {
    fn default() -> Self {
        Self::new()
    }
}
