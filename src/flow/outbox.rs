// Outbox
//
// The producer end of a stream that crosses to another node. The producing
// processor pushes into the outbox like into any receiver; the outbox's own
// task dials the consumer node, batches rows into data frames and reacts to
// the consumer's drain and close signals. Metadata is sent as soon as it
// arrives. A connection failure cancels the whole flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::common::context::{CancelHandle, Context};
use crate::common::settings::Settings;
use crate::common::types::{FlowId, NodeId, StreamId};
use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::{ConsumerStatus, Message, ProducerMetadata, RowReceiver};
use crate::exec::row::Row;
use crate::flow::ctx::FlowCtx;
use crate::flow::Startable;
use crate::net::transport::{Dialer, OutboundConn};
use crate::net::wire::{self, ConsumerSignal, ProducerFrame};

#[derive(Default)]
struct Batch {
    rows: Vec<Row>,
    metadata: Vec<ProducerMetadata>,
    /// When the oldest buffered row arrived
    since: Option<Instant>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.metadata.is_empty()
    }
}

pub struct Outbox {
    flow_id: FlowId,
    stream_id: StreamId,
    target_node: NodeId,
    dialer: Arc<dyn Dialer>,
    settings: Arc<Settings>,
    tx: Mutex<Option<Sender<Message>>>,
    rx: Mutex<Option<Receiver<Message>>>,
    status: AtomicU8,
}

impl Outbox {
    pub fn new(flow_ctx: &FlowCtx, stream_id: StreamId, target_node: NodeId) -> Result<Self> {
        let dialer = flow_ctx.dialer.clone().ok_or_else(|| FlowError::Transport {
            node: target_node,
            message: "no dialer configured".to_string(),
        })?;
        let (tx, rx) = channel::bounded(flow_ctx.settings.row_channel_capacity);
        Ok(Outbox {
            flow_id: flow_ctx.flow_id,
            stream_id,
            target_node,
            dialer,
            settings: Arc::clone(&flow_ctx.settings),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            status: AtomicU8::new(ConsumerStatus::NeedMoreRows.to_u8()),
        })
    }

    fn status(&self) -> ConsumerStatus {
        ConsumerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ConsumerStatus) {
        self.status.fetch_max(status.to_u8(), Ordering::SeqCst);
    }

    fn run(&self, ctx: &Context, rx: Receiver<Message>, flow_cancel: &CancelHandle) {
        match self.stream(ctx, &rx) {
            Ok(()) => debug!(
                "flow {}: outbox for stream {} to node {} done",
                self.flow_id.short(),
                self.stream_id,
                self.target_node
            ),
            Err(err) => {
                warn!(
                    "flow {}: outbox for stream {} to node {} failed: {}",
                    self.flow_id.short(),
                    self.stream_id,
                    self.target_node,
                    err
                );
                flow_cancel.cancel();
            }
        }
        // Later pushes see a disconnected channel and get ConsumerClosed.
        self.set_status(ConsumerStatus::ConsumerClosed);
        drop(rx);
    }

    fn stream(&self, ctx: &Context, rx: &Receiver<Message>) -> Result<()> {
        let mut conn = self.dialer.open_flow_stream(self.target_node)?;
        conn.send(wire::encode(&ProducerFrame::Header {
            flow_id: self.flow_id,
            stream_id: self.stream_id,
        })?)?;
        let signals = conn.signals();
        let mut batch = Batch::default();

        loop {
            let flush_timer = match batch.since {
                Some(since) => channel::at(since + self.settings.outbox_flush_period),
                None => channel::never(),
            };
            select! {
                recv(rx) -> msg => match msg {
                    // rows are dropped once the consumer is draining
                    Ok(Message::Row(row)) => if self.status() == ConsumerStatus::NeedMoreRows {
                        batch.since.get_or_insert_with(Instant::now);
                        batch.rows.push(row);
                        if batch.rows.len() >= self.settings.outbox_buffer_rows {
                            self.flush(conn.as_mut(), &mut batch)?;
                        }
                    },
                    Ok(Message::Meta(meta)) => {
                        batch.metadata.push(meta);
                        self.flush(conn.as_mut(), &mut batch)?;
                    }
                    Err(_) => {
                        // producer done
                        self.flush(conn.as_mut(), &mut batch)?;
                        conn.send(wire::encode(&ProducerFrame::Trailer)?)?;
                        return Ok(());
                    }
                },
                recv(signals) -> signal => {
                    let Ok(bytes) = signal else {
                        return Err(FlowError::Transport {
                            node: self.target_node,
                            message: format!("consumer of stream {} hung up", self.stream_id),
                        });
                    };
                    match wire::decode::<ConsumerSignal>(&bytes)? {
                        ConsumerSignal::Handshake => trace!("stream {}: handshake", self.stream_id),
                        ConsumerSignal::DrainRequest => {
                            debug!("stream {}: consumer requested drain", self.stream_id);
                            self.set_status(ConsumerStatus::DrainRequested);
                            batch.rows.clear();
                            batch.since = None;
                        }
                        ConsumerSignal::Closed => {
                            debug!("stream {}: consumer closed", self.stream_id);
                            return Ok(());
                        }
                    }
                },
                recv(ctx.done()) -> _ => {
                    batch.rows.clear();
                    batch.metadata.push(ProducerMetadata::from_error(FlowError::QueryCanceled));
                    // Best effort; the consumer may already be gone.
                    let _ = self.flush(conn.as_mut(), &mut batch);
                    let _ = wire::encode(&ProducerFrame::Trailer).and_then(|t| conn.send(t));
                    return Ok(());
                },
                recv(flush_timer) -> _ => self.flush(conn.as_mut(), &mut batch)?,
            }
        }
    }

    fn flush(&self, conn: &mut dyn OutboundConn, batch: &mut Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        trace!(
            "stream {}: sending {} rows, {} metadata",
            self.stream_id,
            batch.rows.len(),
            batch.metadata.len()
        );
        let frame = ProducerFrame::data(&batch.rows, std::mem::take(&mut batch.metadata));
        batch.rows.clear();
        batch.since = None;
        conn.send(wire::encode(&frame)?)
    }
}

impl RowReceiver for Outbox {
    fn push(&self, msg: Message) -> ConsumerStatus {
        if self.status() == ConsumerStatus::ConsumerClosed {
            return ConsumerStatus::ConsumerClosed;
        }
        let Some(tx) = self.tx.lock().clone() else {
            return ConsumerStatus::ConsumerClosed;
        };
        if tx.send(msg).is_err() {
            return ConsumerStatus::ConsumerClosed;
        }
        self.status()
    }

    fn producer_done(&self) {
        self.tx.lock().take();
    }
}

impl Startable for Outbox {
    fn start(self: Arc<Self>, ctx: &Context, wg: &WaitGroup, flow_cancel: &CancelHandle) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| FlowError::Internal(format!("outbox for stream {} started twice", self.stream_id)))?;
        let ctx = ctx.clone();
        let wg = wg.clone();
        let flow_cancel = flow_cancel.clone();
        thread::Builder::new()
            .name(format!("outbox-{}-{}", self.flow_id.short(), self.stream_id))
            .spawn(move || {
                self.run(&ctx, rx, &flow_cancel);
                drop(wg);
            })?;
        Ok(())
    }
}
