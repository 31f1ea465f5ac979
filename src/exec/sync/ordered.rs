// Ordered Synchronizer
//
// Merges several sources, each already sorted by the same column ordering,
// into one sorted stream. Ties between equal rows go to the source with the
// lowest index. Unsorted inputs produce unspecified output order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use log::trace;

use crate::exec::receiver::{Message, ProducerMetadata, RowSource};
use crate::exec::row::{ColumnOrdering, Row};

/// A source's current head row
struct HeapEntry {
    row: Row,
    source: usize,
    ordering: Arc<ColumnOrdering>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry, so the comparison is reversed: the
    // least row, then the lowest source index, is the greatest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering
            .compare(&other.row, &self.row)
            .then_with(|| other.source.cmp(&self.source))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    NotInitialized,
    Returning,
    Draining,
    Exhausted,
}

/// Merge synchronizer over k pre-sorted sources
pub struct OrderedSynchronizer {
    ordering: Arc<ColumnOrdering>,
    sources: Vec<Box<dyn RowSource>>,
    exhausted: Vec<bool>,
    heap: BinaryHeap<HeapEntry>,
    state: SyncState,
    /// Source whose head row was emitted last; it is advanced lazily so the
    /// emitted row reaches the consumer before we block on that source.
    needs_advance: Option<usize>,
    pending_meta: VecDeque<ProducerMetadata>,
    /// Next source to poll while draining
    drain_cursor: usize,
}

impl OrderedSynchronizer {
    pub fn new(ordering: ColumnOrdering, sources: Vec<Box<dyn RowSource>>) -> Self {
        let n = sources.len();
        OrderedSynchronizer {
            ordering: Arc::new(ordering),
            sources,
            exhausted: vec![false; n],
            heap: BinaryHeap::with_capacity(n),
            state: SyncState::NotInitialized,
            needs_advance: None,
            pending_meta: VecDeque::new(),
            drain_cursor: 0,
        }
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Pull from source `idx` until it yields a row or runs out. Metadata is
    /// queued for the consumer; an error switches the whole merge to draining.
    fn advance(&mut self, idx: usize) {
        while !self.exhausted[idx] {
            match self.sources[idx].next() {
                None => self.exhausted[idx] = true,
                Some(Message::Row(row)) => {
                    self.heap.push(HeapEntry {
                        row,
                        source: idx,
                        ordering: Arc::clone(&self.ordering),
                    });
                    return;
                }
                Some(Message::Meta(meta)) => {
                    let is_err = meta.err.is_some();
                    self.pending_meta.push_back(meta);
                    if is_err {
                        trace!("ordered synchronizer: error from source {}, draining", idx);
                        self.start_draining();
                        return;
                    }
                }
            }
        }
    }

    fn start_draining(&mut self) {
        if matches!(self.state, SyncState::Draining | SyncState::Exhausted) {
            return;
        }
        self.state = SyncState::Draining;
        self.heap.clear();
        self.needs_advance = None;
        for (idx, source) in self.sources.iter_mut().enumerate() {
            if !self.exhausted[idx] {
                source.consumer_done();
            }
        }
    }

    /// Next metadata message from a draining source, or None when all are
    /// exhausted.
    fn drain_next(&mut self) -> Option<ProducerMetadata> {
        while self.drain_cursor < self.sources.len() {
            let idx = self.drain_cursor;
            if self.exhausted[idx] {
                self.drain_cursor += 1;
                continue;
            }
            match self.sources[idx].next() {
                None => self.exhausted[idx] = true,
                Some(Message::Row(_)) => {}
                Some(Message::Meta(meta)) => return Some(meta),
            }
        }
        None
    }
}

impl RowSource for OrderedSynchronizer {
    fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(meta) = self.pending_meta.pop_front() {
                return Some(Message::Meta(meta));
            }
            match self.state {
                SyncState::NotInitialized => {
                    self.state = SyncState::Returning;
                    for idx in 0..self.sources.len() {
                        if self.state != SyncState::Returning {
                            break;
                        }
                        self.advance(idx);
                    }
                }
                SyncState::Returning => {
                    if let Some(idx) = self.needs_advance.take() {
                        self.advance(idx);
                        continue;
                    }
                    match self.heap.pop() {
                        Some(entry) => {
                            self.needs_advance = Some(entry.source);
                            return Some(Message::Row(entry.row));
                        }
                        None => self.state = SyncState::Exhausted,
                    }
                }
                SyncState::Draining => match self.drain_next() {
                    Some(meta) => return Some(Message::Meta(meta)),
                    None => self.state = SyncState::Exhausted,
                },
                SyncState::Exhausted => return None,
            }
        }
    }

    fn consumer_done(&mut self) {
        self.start_draining();
    }

    fn consumer_closed(&mut self) {
        for (idx, source) in self.sources.iter_mut().enumerate() {
            if !self.exhausted[idx] {
                source.consumer_closed();
                self.exhausted[idx] = true;
            }
        }
        self.heap.clear();
        self.pending_meta.clear();
        self.state = SyncState::Exhausted;
    }
}
