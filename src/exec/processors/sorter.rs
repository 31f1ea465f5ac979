// Sorter Processor
//
// Buffers its whole input, sorts it by a column ordering and emits it. The
// buffered rows are charged to a memory account; exceeding the budget turns
// into error metadata. Metadata read from the input is forwarded before
// any sorted rows.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use crate::common::memory::{BoundAccount, MemoryMonitor};
use crate::exec::receiver::{Message, RowSource};
use crate::exec::row::{ColumnOrdering, Row};

pub struct Sorter {
    input: Box<dyn RowSource>,
    ordering: ColumnOrdering,
    account: Arc<BoundAccount>,
    /// Sorted output, filled on the first call to `next`
    sorted: Option<VecDeque<Row>>,
    pending_meta: VecDeque<Message>,
    input_done: bool,
}

impl Sorter {
    pub fn new(input: Box<dyn RowSource>, ordering: ColumnOrdering, monitor: &Arc<MemoryMonitor>) -> Self {
        Sorter {
            input,
            ordering,
            account: monitor.make_account(),
            sorted: None,
            pending_meta: VecDeque::new(),
            input_done: false,
        }
    }

    fn fill(&mut self) {
        let mut rows = Vec::new();
        let mut failed = false;
        while let Some(msg) = self.input.next() {
            match msg {
                Message::Row(row) => {
                    if failed {
                        continue;
                    }
                    if let Err(err) = self.account.grow(row.byte_size()) {
                        failed = true;
                        self.pending_meta.push_back(Message::error(err));
                        self.input.consumer_done();
                        continue;
                    }
                    rows.push(row);
                }
                Message::Meta(meta) => {
                    if meta.err.is_some() && !failed {
                        failed = true;
                        self.input.consumer_done();
                    }
                    self.pending_meta.push_back(Message::Meta(meta));
                }
            }
        }
        self.input_done = true;

        if failed {
            rows.clear();
            self.account.clear();
        } else {
            // stable, so equal keys keep their arrival order
            rows.sort_by(|a, b| self.ordering.compare(a, b));
            debug!("sorter buffered {} rows ({} bytes)", rows.len(), self.account.used());
        }
        self.sorted = Some(rows.into());
    }
}

impl RowSource for Sorter {
    fn next(&mut self) -> Option<Message> {
        if self.sorted.is_none() {
            self.fill();
        }
        if let Some(meta) = self.pending_meta.pop_front() {
            return Some(meta);
        }
        let sorted = self.sorted.as_mut()?;
        match sorted.pop_front() {
            Some(row) => {
                self.account.shrink(row.byte_size());
                Some(Message::Row(row))
            }
            None => {
                if !self.account.is_closed() {
                    self.account.close();
                }
                None
            }
        }
    }

    fn consumer_done(&mut self) {
        if let Some(sorted) = self.sorted.as_mut() {
            sorted.clear();
            self.account.clear();
        } else {
            self.input.consumer_done();
        }
    }

    fn consumer_closed(&mut self) {
        if !self.input_done {
            self.input.consumer_closed();
        }
        self.sorted = Some(VecDeque::new());
        self.pending_meta.clear();
    }
}

impl Drop for Sorter {
    fn drop(&mut self) {
        if !self.account.is_closed() {
            self.account.close();
        }
    }
}
