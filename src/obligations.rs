//! Proof obligations and the queues that schedule them.
//!
//! An obligation `(i, s, delta)` asks the search to show that frame `i`
//! can bound state `s` by `delta`. Queues pop the obligation with the
//! smallest frame index first (ties broken by state id, so runs are
//! deterministic) and share the smallest bound requested for each state
//! through a [`SearchEpoch`], which lives in the driver and survives until
//! the next oracle refinement resets the search.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use log::trace;

use crate::probability::{Probability, StateId};

/// Per-search bookkeeping shared by all queue variants: the smallest
/// bound ever requested for each state. The probability solver reads it
/// to keep the bounds of states already on the current path consistent.
#[derive(Default)]
pub struct SearchEpoch {
    smallest: HashMap<StateId, Probability>,
}

impl SearchEpoch {
    pub fn smallest_bound(&self, state: StateId) -> Option<&Probability> {
        self.smallest.get(&state)
    }

    pub fn record(&mut self, state: StateId, bound: &Probability) {
        match self.smallest.get_mut(&state) {
            Some(current) if *current <= *bound => {}
            Some(current) => *current = bound.clone(),
            None => {
                self.smallest.insert(state, bound.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        self.smallest.clear();
    }
}

#[derive(Clone, Debug)]
pub struct Obligation {
    pub frame: usize,
    pub state: StateId,
    pub bound: Probability,
    /// States on the path that led to this obligation.
    pub history: BTreeSet<StateId>,
}

impl Obligation {
    pub fn new(frame: usize, state: StateId, bound: Probability, history: BTreeSet<StateId>) -> Self {
        Obligation {
            frame,
            state,
            bound,
            history,
        }
    }
}

pub trait ObligationQueue {
    fn push(&mut self, epoch: &mut SearchEpoch, obligation: Obligation);

    fn pop(&mut self, epoch: &mut SearchEpoch) -> Option<Obligation>;

    /// Called after an obligation has been discharged, giving repushing
    /// variants the chance to schedule it again one frame further out.
    fn repush(&mut self, epoch: &mut SearchEpoch, obligation: Obligation);

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    fn clear(&mut self);
}

/// Deduplicating queue: at most one entry per `(frame, state)` pair, the
/// bound read back at pop time is the smallest one recorded so far.
#[derive(Default)]
pub struct PlainQueue {
    heap: BinaryHeap<Reverse<(usize, usize)>>,
    queued: HashSet<(usize, StateId)>,
    histories: HashMap<(usize, StateId), BTreeSet<StateId>>,
}

impl PlainQueue {
    fn push_inner(&mut self, epoch: &mut SearchEpoch, obligation: Obligation) {
        // The history read back at pop time must belong to the smallest
        // bound recorded for the state, so a weaker push never replaces it.
        let improves = epoch
            .smallest_bound(obligation.state)
            .map_or(true, |current| obligation.bound < *current);
        epoch.record(obligation.state, &obligation.bound);
        let key = (obligation.frame, obligation.state);
        if improves || !self.histories.contains_key(&key) {
            self.histories.insert(key, obligation.history);
        }
        if self.queued.insert(key) {
            self.heap.push(Reverse((obligation.frame, obligation.state.0)));
        }
    }

    fn pop_inner(&mut self, epoch: &mut SearchEpoch) -> Option<Obligation> {
        let Reverse((frame, state)) = self.heap.pop()?;
        let state = StateId(state);
        self.queued.remove(&(frame, state));
        let history = self.histories.remove(&(frame, state)).unwrap_or_default();
        let bound = epoch
            .smallest_bound(state)
            .cloned()
            .unwrap_or_else(Probability::one);
        trace!("popped ({frame}, {state}, {bound})");
        Some(Obligation::new(frame, state, bound, history))
    }

    fn clear_inner(&mut self) {
        self.heap.clear();
        self.queued.clear();
        self.histories.clear();
    }
}

impl ObligationQueue for PlainQueue {
    fn push(&mut self, epoch: &mut SearchEpoch, obligation: Obligation) {
        self.push_inner(epoch, obligation);
    }

    fn pop(&mut self, epoch: &mut SearchEpoch) -> Option<Obligation> {
        self.pop_inner(epoch)
    }

    fn repush(&mut self, _epoch: &mut SearchEpoch, _obligation: Obligation) {}

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn clear(&mut self) {
        self.clear_inner();
    }
}

/// Like [`PlainQueue`], but a discharged obligation is scheduled again one
/// frame further out, so facts keep getting pushed towards the outermost
/// frame during strengthening.
#[derive(Default)]
pub struct RepushingQueue {
    inner: PlainQueue,
    max_frame: usize,
}

impl RepushingQueue {
    pub fn new(max_frame: usize) -> Self {
        RepushingQueue {
            inner: PlainQueue::default(),
            max_frame,
        }
    }
}

impl ObligationQueue for RepushingQueue {
    fn push(&mut self, epoch: &mut SearchEpoch, obligation: Obligation) {
        self.max_frame = self.max_frame.max(obligation.frame);
        self.inner.push_inner(epoch, obligation);
    }

    fn pop(&mut self, epoch: &mut SearchEpoch) -> Option<Obligation> {
        self.inner.pop_inner(epoch)
    }

    fn repush(&mut self, epoch: &mut SearchEpoch, obligation: Obligation) {
        if obligation.frame >= self.max_frame {
            return;
        }
        let repushed = Obligation::new(
            obligation.frame + 1,
            obligation.state,
            obligation.bound,
            obligation.history,
        );
        self.inner.push_inner(epoch, repushed);
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn clear(&mut self) {
        self.inner.clear_inner();
    }
}

/// No deduplication and no shared-bound lookup at pop time; every pushed
/// obligation is popped exactly once, in frame order with insertion order
/// breaking ties. Mostly useful as a baseline.
#[derive(Default)]
pub struct NaiveRepushingQueue {
    heap: BinaryHeap<Reverse<(usize, usize, usize)>>,
    entries: HashMap<usize, Obligation>,
    next_ticket: usize,
    max_frame: usize,
}

impl NaiveRepushingQueue {
    pub fn new(max_frame: usize) -> Self {
        NaiveRepushingQueue {
            max_frame,
            ..Default::default()
        }
    }
}

impl ObligationQueue for NaiveRepushingQueue {
    fn push(&mut self, epoch: &mut SearchEpoch, obligation: Obligation) {
        epoch.record(obligation.state, &obligation.bound);
        self.max_frame = self.max_frame.max(obligation.frame);
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.heap
            .push(Reverse((obligation.frame, obligation.state.0, ticket)));
        self.entries.insert(ticket, obligation);
    }

    fn pop(&mut self, _epoch: &mut SearchEpoch) -> Option<Obligation> {
        let Reverse((_, _, ticket)) = self.heap.pop()?;
        self.entries.remove(&ticket)
    }

    fn repush(&mut self, epoch: &mut SearchEpoch, obligation: Obligation) {
        if obligation.frame >= self.max_frame {
            return;
        }
        let repushed = Obligation::new(
            obligation.frame + 1,
            obligation.state,
            obligation.bound,
            obligation.history,
        );
        self.push(epoch, repushed);
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
        self.next_ticket = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ob(frame: usize, state: usize, num: i64, den: i64) -> Obligation {
        Obligation::new(
            frame,
            StateId(state),
            Probability::from_ratio(num, den),
            BTreeSet::new(),
        )
    }

    #[test]
    fn pop_prefers_smaller_frames_and_shares_the_smallest_bound() {
        let mut epoch = SearchEpoch::default();
        let mut queue = RepushingQueue::new(2);
        queue.push(&mut epoch, ob(2, 7, 1, 2));
        queue.push(&mut epoch, ob(1, 7, 3, 10));

        let first = queue.pop(&mut epoch).unwrap();
        assert_eq!(first.frame, 1);
        assert_eq!(first.bound, Probability::from_ratio(3, 10));

        // The later pop for the same state sees the smaller bound too.
        let second = queue.pop(&mut epoch).unwrap();
        assert_eq!(second.frame, 2);
        assert_eq!(second.bound, Probability::from_ratio(3, 10));
        assert_eq!(
            epoch.smallest_bound(StateId(7)),
            Some(&Probability::from_ratio(3, 10))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn plain_queue_deduplicates_per_frame_and_state() {
        let mut epoch = SearchEpoch::default();
        let mut queue = PlainQueue::default();
        queue.push(&mut epoch, ob(1, 3, 1, 2));
        queue.push(&mut epoch, ob(1, 3, 1, 4));
        assert_eq!(queue.len(), 1);
        let popped = queue.pop(&mut epoch).unwrap();
        assert_eq!(popped.bound, Probability::from_ratio(1, 4));
        assert!(queue.pop(&mut epoch).is_none());
    }

    #[test]
    fn history_stays_with_the_smallest_bound() {
        let mut epoch = SearchEpoch::default();
        let mut queue = PlainQueue::default();
        let strong = Obligation::new(
            1,
            StateId(3),
            Probability::from_ratio(1, 2),
            BTreeSet::from([StateId(7)]),
        );
        let weak = Obligation::new(
            1,
            StateId(3),
            Probability::from_ratio(3, 4),
            BTreeSet::from([StateId(9)]),
        );
        queue.push(&mut epoch, strong);
        queue.push(&mut epoch, weak);

        let popped = queue.pop(&mut epoch).unwrap();
        assert_eq!(popped.bound, Probability::from_ratio(1, 2));
        assert_eq!(popped.history, BTreeSet::from([StateId(7)]));
    }

    #[test]
    fn bound_recording_never_grows() {
        let mut epoch = SearchEpoch::default();
        epoch.record(StateId(0), &Probability::from_ratio(1, 4));
        epoch.record(StateId(0), &Probability::from_ratio(1, 2));
        assert_eq!(
            epoch.smallest_bound(StateId(0)),
            Some(&Probability::from_ratio(1, 4))
        );
    }

    #[test]
    fn repush_stops_at_the_outermost_frame() {
        let mut epoch = SearchEpoch::default();
        let mut queue = RepushingQueue::new(2);
        queue.push(&mut epoch, ob(2, 0, 1, 2));
        let popped = queue.pop(&mut epoch).unwrap();
        queue.repush(&mut epoch, popped);
        assert!(queue.is_empty());
    }

    #[test]
    fn naive_queue_keeps_duplicates_in_insertion_order() {
        let mut epoch = SearchEpoch::default();
        let mut queue = NaiveRepushingQueue::new(2);
        queue.push(&mut epoch, ob(1, 5, 1, 2));
        queue.push(&mut epoch, ob(1, 5, 1, 4));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(&mut epoch).unwrap().bound, Probability::from_ratio(1, 2));
        assert_eq!(queue.pop(&mut epoch).unwrap().bound, Probability::from_ratio(1, 4));
    }
}
