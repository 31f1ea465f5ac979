// Row Receivers and Sources
//
// The push and pull capabilities shared by every graph component: row
// channels, ordered synchronizers, routers, outboxes, processors and the
// terminal sink. The graph shape is only known at setup time, so components
// are wired together as trait objects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::common::memory::BoundAccount;
use crate::exec::error::FlowError;
use crate::exec::row::Row;

/// Out-of-band information a producer sends alongside (or instead of) rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerMetadata {
    pub err: Option<FlowError>,
}

impl ProducerMetadata {
    pub fn from_error(err: FlowError) -> Self {
        ProducerMetadata { err: Some(err) }
    }
}

/// One unit travelling down a stream
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Row(Row),
    Meta(ProducerMetadata),
}

impl Message {
    pub fn error(err: FlowError) -> Self {
        Message::Meta(ProducerMetadata::from_error(err))
    }

    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Message::Row(row) => Some(row),
            Message::Meta(_) => None,
        }
    }
}

/// What a consumer wants from its producer after a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConsumerStatus {
    /// Keep sending rows and metadata
    NeedMoreRows,
    /// Stop sending rows, but keep sending metadata until done
    DrainRequested,
    /// Nothing more will be read; stop producing
    ConsumerClosed,
}

impl ConsumerStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConsumerStatus::NeedMoreRows => 0,
            ConsumerStatus::DrainRequested => 1,
            ConsumerStatus::ConsumerClosed => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsumerStatus::NeedMoreRows,
            1 => ConsumerStatus::DrainRequested,
            _ => ConsumerStatus::ConsumerClosed,
        }
    }
}

/// Push side of a stream.
///
/// A producer calls `push` any number of times and then `producer_done`
/// exactly once.
pub trait RowReceiver: Send + Sync {
    fn push(&self, msg: Message) -> ConsumerStatus;

    fn producer_done(&self);
}

/// Pull side of a stream.
///
/// `next` returns `None` once the source is exhausted; after that it must not
/// be called again.
pub trait RowSource: Send {
    fn next(&mut self) -> Option<Message>;

    /// The consumer wants no more rows; the source keeps returning metadata
    /// until it is exhausted.
    fn consumer_done(&mut self);

    /// The consumer is going away and will not call `next` again.
    fn consumer_closed(&mut self);
}

/// Wraps an output so rows handed downstream never share a buffer with the
/// producer. Producers are free to keep and reuse the rows they push.
pub struct CopyingRowReceiver {
    inner: Arc<dyn RowReceiver>,
}

impl CopyingRowReceiver {
    pub fn new(inner: Arc<dyn RowReceiver>) -> Self {
        CopyingRowReceiver { inner }
    }
}

impl RowReceiver for CopyingRowReceiver {
    fn push(&self, msg: Message) -> ConsumerStatus {
        match msg {
            Message::Row(mut row) => {
                row.detach();
                self.inner.push(Message::Row(row))
            }
            meta => self.inner.push(meta),
        }
    }

    fn producer_done(&self) {
        self.inner.producer_done();
    }
}

/// Clears the evaluation scratch account on every pushed message; sits in
/// front of the terminal consumer.
pub struct AccountClearingRowReceiver {
    inner: Arc<dyn RowReceiver>,
    account: Arc<BoundAccount>,
}

impl AccountClearingRowReceiver {
    pub fn new(inner: Arc<dyn RowReceiver>, account: Arc<BoundAccount>) -> Self {
        AccountClearingRowReceiver { inner, account }
    }
}

impl RowReceiver for AccountClearingRowReceiver {
    fn push(&self, msg: Message) -> ConsumerStatus {
        self.account.clear();
        self.inner.push(msg)
    }

    fn producer_done(&self) {
        self.inner.producer_done();
    }
}

#[derive(Default)]
struct RowBufferState {
    rows: Vec<Row>,
    metadata: Vec<ProducerMetadata>,
    producer_done: bool,
    status: Option<ConsumerStatus>,
}

/// Terminal sink that records everything pushed into it.
///
/// Used as the sync-response consumer by tests and by the demo binary.
pub struct RowBuffer {
    state: Mutex<RowBufferState>,
    done: Condvar,
    /// Number of rows after which the buffer asks its producer to drain
    row_limit: Option<usize>,
}

impl Default for RowBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RowBuffer {
    pub fn new() -> Self {
        RowBuffer {
            state: Mutex::new(RowBufferState::default()),
            done: Condvar::new(),
            row_limit: None,
        }
    }

    /// A buffer that requests draining after `limit` rows
    pub fn with_row_limit(limit: usize) -> Self {
        RowBuffer {
            row_limit: Some(limit),
            ..Self::new()
        }
    }

    /// Force the status returned from subsequent pushes
    pub fn set_status(&self, status: ConsumerStatus) {
        self.state.lock().status = Some(status);
    }

    pub fn rows(&self) -> Vec<Row> {
        self.state.lock().rows.clone()
    }

    pub fn metadata(&self) -> Vec<ProducerMetadata> {
        self.state.lock().metadata.clone()
    }

    /// The first error received, if any
    pub fn first_error(&self) -> Option<FlowError> {
        self.state
            .lock()
            .metadata
            .iter()
            .find_map(|m| m.err.clone())
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().producer_done
    }

    /// Block until the producer is done or the timeout elapses; returns
    /// whether the producer finished.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.producer_done {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return state.producer_done;
            }
        }
        true
    }

    /// Move the recorded rows out of the buffer
    pub fn take_rows(&self) -> Vec<Row> {
        std::mem::take(&mut self.state.lock().rows)
    }
}

impl RowReceiver for RowBuffer {
    fn push(&self, msg: Message) -> ConsumerStatus {
        let mut state = self.state.lock();
        if state.producer_done {
            panic!("push after producer_done");
        }
        match msg {
            Message::Row(row) => state.rows.push(row),
            Message::Meta(meta) => state.metadata.push(meta),
        }
        if let Some(status) = state.status {
            return status;
        }
        match self.row_limit {
            Some(limit) if state.rows.len() >= limit => ConsumerStatus::DrainRequested,
            _ => ConsumerStatus::NeedMoreRows,
        }
    }

    fn producer_done(&self) {
        let mut state = self.state.lock();
        if state.producer_done {
            panic!("RowBuffer producer_done called twice");
        }
        state.producer_done = true;
        self.done.notify_all();
    }
}

/// A source over a fixed list of messages; handy for wiring tests.
pub struct VecSource {
    messages: VecDeque<Message>,
    draining: bool,
}

impl VecSource {
    pub fn new(messages: Vec<Message>) -> Self {
        VecSource {
            messages: messages.into(),
            draining: false,
        }
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self::new(rows.into_iter().map(Message::Row).collect())
    }
}

impl RowSource for VecSource {
    fn next(&mut self) -> Option<Message> {
        loop {
            let msg = self.messages.pop_front()?;
            if self.draining && matches!(msg, Message::Row(_)) {
                continue;
            }
            return Some(msg);
        }
    }

    fn consumer_done(&mut self) {
        self.draining = true;
    }

    fn consumer_closed(&mut self) {
        self.messages.clear();
    }
}
