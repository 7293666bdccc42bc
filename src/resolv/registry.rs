//! The registry of live lookups.
//!
//! Every active resolution is one [`Record`] stored in a slab. Four
//! views index the slab: the caller map as the primary key, the
//! ordered id map, the two deadline timelines, and the queue of
//! records whose query still awaits transmission. All views hold slab
//! keys and stay consistent under the single lock of the owning
//! service; a record leaves all of them in one step before its caller
//! ever hears about the outcome.
//!
//! Deadlines sit on a wrapping 32 bit millisecond timeline, so values
//! from before and after the wrap point cannot share one ordered
//! collection. A record whose deadline wraps goes into the second
//! timeline; when the tick value is observed crossing back into the
//! lower half of its range, everything still in the first timeline is
//! expired and the two switch roles.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use slab::Slab;

use crate::ticks::Ticks;

use super::LookupHandler;

//------------ CallerKey -----------------------------------------------------

/// The identity of a caller, derived from its handler allocation.
pub(super) type CallerKey = usize;

//------------ Record --------------------------------------------------------

/// One active resolution request.
pub(super) struct Record {
    /// The identity of the caller.
    pub caller: CallerKey,

    /// The handler to notify on completion.
    pub handler: Arc<dyn LookupHandler>,

    /// The host name being resolved.
    pub hostname: String,

    /// The transaction id, unique among all live records.
    pub id: u16,

    /// The absolute deadline in ticks.
    pub deadline: u32,

    /// Which of the two timelines holds the record.
    timeline: usize,

    /// The position in the pending-send queue, if not yet sent.
    send_pos: Option<u64>,
}

//------------ Registry ------------------------------------------------------

/// The four-way indexed collection of live records.
pub(super) struct Registry {
    /// The records themselves.
    records: Slab<Record>,

    /// Primary index: one record per caller.
    by_caller: HashMap<CallerKey, usize>,

    /// Records by transaction id, ordered for allocation.
    by_id: BTreeMap<u16, usize>,

    /// The two deadline timelines as ordered (deadline, key) sets.
    timelines: [BTreeSet<(u32, usize)>; 2],

    /// Which timeline currently holds the unwrapped deadlines.
    active: usize,

    /// Records awaiting transmission, in strict insertion order.
    send_queue: BTreeMap<u64, usize>,

    /// The next send queue sequence number.
    next_send_seq: u64,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            records: Slab::new(),
            by_caller: HashMap::new(),
            by_id: BTreeMap::new(),
            timelines: [BTreeSet::new(), BTreeSet::new()],
            active: 0,
            send_queue: BTreeMap::new(),
            next_send_seq: 0,
        }
    }

    /// Returns whether there are no live records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns whether the given caller has a live record.
    pub fn contains_caller(&self, caller: CallerKey) -> bool {
        self.by_caller.contains_key(&caller)
    }

    /// Picks the transaction id for a new record.
    ///
    /// Deterministic over the set of ids in use: an empty set yields 0,
    /// a set not containing 0 yields one below its minimum, otherwise
    /// one above the maximum if the top id is still free, and only then
    /// the first gap above 0. Returns `None` if all 65536 ids are
    /// taken.
    pub fn find_free_id(&self) -> Option<u16> {
        let first = match self.by_id.keys().next() {
            Some(&first) => first,
            None => return Some(0),
        };
        if first != 0 {
            return Some(first - 1);
        }
        let last = *self.by_id.keys().next_back()?;
        if last != u16::MAX {
            return Some(last + 1);
        }
        let mut prev = first;
        for &id in self.by_id.keys().skip(1) {
            if id - prev > 1 {
                return Some(prev + 1);
            }
            prev = id;
        }
        None
    }

    /// Inserts a new record and queues it for sending.
    ///
    /// The caller must not have a live record and the id must be free.
    /// `now` decides which timeline receives the deadline: one that
    /// wraps past the end of the tick range belongs to the second.
    /// Returns the number of records now awaiting transmission.
    pub fn insert(
        &mut self,
        caller: CallerKey,
        handler: Arc<dyn LookupHandler>,
        hostname: String,
        id: u16,
        now: Ticks,
        timeout: u32,
    ) -> usize {
        debug_assert!(!self.contains_caller(caller));
        debug_assert!(!self.by_id.contains_key(&id));
        let deadline = now.wrapping_add(timeout).value();
        let timeline = if deadline < now.value() {
            self.active ^ 1
        } else {
            self.active
        };
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        let key = self.records.insert(Record {
            caller,
            handler,
            hostname,
            id,
            deadline,
            timeline,
            send_pos: Some(seq),
        });
        self.by_caller.insert(caller, key);
        self.by_id.insert(id, key);
        self.timelines[timeline].insert((deadline, key));
        self.send_queue.insert(seq, key);
        self.send_queue.len()
    }

    /// Removes the record of the given caller, if there is one.
    pub fn remove_by_caller(
        &mut self,
        caller: CallerKey,
    ) -> Option<Record> {
        let key = self.by_caller.get(&caller).copied()?;
        Some(self.detach(key))
    }

    /// Removes the record with the given transaction id, if any.
    pub fn remove_by_id(&mut self, id: u16) -> Option<Record> {
        let key = self.by_id.get(&id).copied()?;
        Some(self.detach(key))
    }

    /// Removes some live record, if any is left.
    pub fn remove_any(&mut self) -> Option<Record> {
        let key = self.records.iter().next().map(|(key, _)| key)?;
        Some(self.detach(key))
    }

    /// Returns the key of the record at the head of the send queue.
    pub fn send_head(&self) -> Option<usize> {
        self.send_queue.values().next().copied()
    }

    /// Returns whether any record awaits transmission.
    pub fn send_queue_is_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    /// Returns the record stored under the given key.
    pub fn record(&self, key: usize) -> &Record {
        &self.records[key]
    }

    /// Marks the record under the given key as sent.
    pub fn mark_sent(&mut self, key: usize) {
        if let Some(seq) = self.records[key].send_pos.take() {
            self.send_queue.remove(&seq);
        }
    }

    /// Returns the earliest deadline on the active timeline.
    pub fn next_deadline(&self) -> Option<u32> {
        self.timelines[self.active]
            .iter()
            .next()
            .map(|&(deadline, _)| deadline)
    }

    /// Removes the earliest record on the active timeline if it is due.
    pub fn remove_expired(&mut self, now: Ticks) -> Option<Record> {
        let &(deadline, key) =
            self.timelines[self.active].iter().next()?;
        if deadline <= now.value() {
            Some(self.detach(key))
        } else {
            None
        }
    }

    /// Removes some record from the inactive timeline, due or not.
    ///
    /// Used to flush the pre-wrap epoch: once the tick value is seen
    /// crossing back into the lower half of its range, the timelines
    /// are flipped first and the old epoch is then drained from the
    /// inactive side. Flipping first keeps records inserted by
    /// completion callbacks during the drain on the correct timeline.
    pub fn remove_outdated(&mut self) -> Option<Record> {
        let &(_, key) = self.timelines[self.active ^ 1].iter().next()?;
        Some(self.detach(key))
    }

    /// Switches the roles of the two timelines.
    pub fn flip_timelines(&mut self) {
        self.active ^= 1;
    }

    /// Detaches the record under `key` from every view.
    fn detach(&mut self, key: usize) -> Record {
        let record = self.records.remove(key);
        self.by_caller.remove(&record.caller);
        self.by_id.remove(&record.id);
        self.timelines[record.timeline]
            .remove(&(record.deadline, key));
        if let Some(seq) = record.send_pos {
            self.send_queue.remove(&seq);
        }
        record
    }
}

//============ Testing =======================================================
