// Row Channel
//
// Bounded multi-producer, single-consumer conduit of rows. The channel is
// created for a fixed number of producers and reports exhaustion to its
// consumer only after every one of them has called `producer_done`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use log::error;
use parking_lot::Mutex;

use crate::exec::receiver::{ConsumerStatus, Message, RowReceiver, RowSource};

/// Create a row channel expecting `num_senders` producers. Producers block
/// once `capacity` messages are queued.
pub fn row_channel(num_senders: usize, capacity: usize) -> (Arc<RowChannel>, RowChannelSource) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let status = Arc::new(AtomicU8::new(ConsumerStatus::NeedMoreRows.to_u8()));
    let sender = RowChannel {
        sender: Mutex::new(if num_senders > 0 { Some(tx) } else { None }),
        remaining_senders: AtomicUsize::new(num_senders),
        num_senders,
        status: Arc::clone(&status),
    };
    let source = RowChannelSource {
        rx: Some(rx),
        status,
    };
    (Arc::new(sender), source)
}

/// Producer half of a row channel
pub struct RowChannel {
    /// Dropped once the last producer is done, which disconnects the consumer
    sender: Mutex<Option<Sender<Message>>>,
    remaining_senders: AtomicUsize,
    num_senders: usize,
    status: Arc<AtomicU8>,
}

impl RowChannel {
    pub fn num_senders(&self) -> usize {
        self.num_senders
    }

    /// Producers that have not called `producer_done` yet
    pub fn remaining_senders(&self) -> usize {
        self.remaining_senders.load(Ordering::SeqCst)
    }

    fn status(&self) -> ConsumerStatus {
        ConsumerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}

impl RowReceiver for RowChannel {
    fn push(&self, msg: Message) -> ConsumerStatus {
        if self.status() == ConsumerStatus::ConsumerClosed {
            return ConsumerStatus::ConsumerClosed;
        }
        // Send on a clone so a blocked producer does not hold the lock that
        // producer_done needs.
        let tx = match self.sender.lock().clone() {
            Some(tx) => tx,
            None => {
                error!("push on row channel after all {} producers finished", self.num_senders);
                return ConsumerStatus::ConsumerClosed;
            }
        };
        if tx.send(msg).is_err() {
            return ConsumerStatus::ConsumerClosed;
        }
        self.status()
    }

    fn producer_done(&self) {
        let previous = self
            .remaining_senders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.sender.lock().take();
            }
            Ok(_) => {}
            Err(_) => error!("producer_done called more times than the {} expected producers", self.num_senders),
        }
    }
}

/// Consumer half of a row channel
pub struct RowChannelSource {
    rx: Option<Receiver<Message>>,
    status: Arc<AtomicU8>,
}

impl RowChannelSource {
    fn draining(&self) -> bool {
        self.status.load(Ordering::SeqCst) == ConsumerStatus::DrainRequested.to_u8()
    }
}

impl RowSource for RowChannelSource {
    fn next(&mut self) -> Option<Message> {
        loop {
            let msg = self.rx.as_ref()?.recv().ok()?;
            // Rows already in flight when draining started are discarded.
            if self.draining() && matches!(msg, Message::Row(_)) {
                continue;
            }
            return Some(msg);
        }
    }

    fn consumer_done(&mut self) {
        let _ = self.status.compare_exchange(
            ConsumerStatus::NeedMoreRows.to_u8(),
            ConsumerStatus::DrainRequested.to_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn consumer_closed(&mut self) {
        self.status.store(ConsumerStatus::ConsumerClosed.to_u8(), Ordering::SeqCst);
        // Dropping the receiver unblocks producers waiting on a full channel.
        self.rx = None;
    }
}
