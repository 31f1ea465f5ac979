// Router Output
//
// One downstream stream of a router with its own buffer and task. The router
// only ever appends to the buffer, so a slow or blocked stream delays its
// own rows but never the router or the other outputs. Buffered rows are
// charged to the router's memory account.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::memory::BoundAccount;
use crate::exec::error::Result;
use crate::exec::receiver::{ConsumerStatus, Message, RowReceiver};

struct OutputState {
    queue: VecDeque<Message>,
    producer_done: bool,
    /// Last status reported by the stream
    status: ConsumerStatus,
}

pub(crate) struct RouterOutput {
    stream: Arc<dyn RowReceiver>,
    state: Mutex<OutputState>,
    ready: Condvar,
    account: Arc<BoundAccount>,
}

impl RouterOutput {
    pub(crate) fn new(stream: Arc<dyn RowReceiver>, account: Arc<BoundAccount>) -> Self {
        RouterOutput {
            stream,
            state: Mutex::new(OutputState {
                queue: VecDeque::new(),
                producer_done: false,
                status: ConsumerStatus::NeedMoreRows,
            }),
            ready: Condvar::new(),
            account,
        }
    }

    pub(crate) fn status(&self) -> ConsumerStatus {
        self.state.lock().status
    }

    /// Queue a message for the stream. Rows are dropped once the stream no
    /// longer wants them.
    pub(crate) fn add(&self, msg: Message) -> Result<()> {
        let mut state = self.state.lock();
        match (&msg, state.status) {
            (_, ConsumerStatus::ConsumerClosed) => return Ok(()),
            (Message::Row(_), ConsumerStatus::DrainRequested) => return Ok(()),
            (Message::Row(row), _) => self.account.grow(row.byte_size())?,
            _ => {}
        }
        state.queue.push_back(msg);
        self.ready.notify_one();
        Ok(())
    }

    pub(crate) fn producer_done(&self) {
        let mut state = self.state.lock();
        state.producer_done = true;
        self.ready.notify_one();
    }

    /// Body of the output's task: forward queued messages until the router's
    /// producer is done, then signal `producer_done` on the stream.
    pub(crate) fn run(&self) {
        loop {
            let msg = {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.producer_done {
                    self.ready.wait(&mut state);
                }
                match state.queue.pop_front() {
                    Some(msg) => msg,
                    None => break,
                }
            };
            if let Message::Row(row) = &msg {
                self.account.shrink(row.byte_size());
            }

            let status = self.stream.push(msg);
            if status != ConsumerStatus::NeedMoreRows {
                self.update_status(status);
            }
        }
        self.stream.producer_done();
    }

    fn update_status(&self, status: ConsumerStatus) {
        let mut state = self.state.lock();
        if status <= state.status {
            return;
        }
        trace!("router output moving to {:?}", status);
        state.status = status;
        // Drop what the stream no longer wants.
        let before = state.queue.len();
        let mut released = 0;
        state.queue.retain(|m| match m {
            Message::Row(row) => {
                released += row.byte_size();
                false
            }
            Message::Meta(_) => status != ConsumerStatus::ConsumerClosed,
        });
        self.account.shrink(released);
        if before != state.queue.len() && status == ConsumerStatus::ConsumerClosed {
            warn!("router output closed with {} messages pending", before);
        }
    }
}
