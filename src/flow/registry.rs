// Flow Registry
//
// Process-wide table of the flows running on this node that still expect
// inbound streams from other nodes. Remote producers rendezvous with their
// consumer here. A flow's streams that do not connect within the timeout
// are handed a deadline-exceeded error so nothing waits on them forever.
//
// Every read-modify-write of an entry happens under the single registry
// lock. Receivers are only pushed to after the lock is released; the
// connected/finished/canceled flags marked under the lock make sure only one
// party ever completes a given stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::context::Context;
use crate::common::types::{FlowId, NodeId, StreamId};
use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::{Message, RowReceiver};

/// Bookkeeping for one inbound stream of a registered flow
pub struct InboundStreamInfo {
    receiver: Arc<dyn RowReceiver>,
    connected: bool,
    finished: bool,
    canceled: bool,
    /// The flow's completion counter contribution, released when the
    /// stream finishes
    wait_group: Option<WaitGroup>,
}

impl InboundStreamInfo {
    pub fn new(receiver: Arc<dyn RowReceiver>, wait_group: WaitGroup) -> Self {
        InboundStreamInfo {
            receiver,
            connected: false,
            finished: false,
            canceled: false,
            wait_group: Some(wait_group),
        }
    }

    /// Mark a never-connected stream canceled and finished, returning what
    /// must be notified once the registry lock is released
    fn abandon(&mut self) -> (Arc<dyn RowReceiver>, Option<WaitGroup>) {
        self.canceled = true;
        self.finished = true;
        (Arc::clone(&self.receiver), self.wait_group.take())
    }
}

struct FlowEntry {
    ctx: Context,
    inbound_streams: HashMap<StreamId, InboundStreamInfo>,
    /// Dropping it stops the connection timer
    stop_timer: Option<Sender<()>>,
}

impl FlowEntry {
    fn all_finished(&self) -> bool {
        self.inbound_streams.values().all(|s| s.finished)
    }
}

/// Registry of flows awaiting inbound streams
pub struct FlowRegistry {
    node_id: NodeId,
    flows: Mutex<HashMap<FlowId, FlowEntry>>,
    /// Notified whenever a flow registers
    flow_registered: Condvar,
}

impl FlowRegistry {
    pub fn new(node_id: NodeId) -> Arc<Self> {
        Arc::new(FlowRegistry {
            node_id,
            flows: Mutex::new(HashMap::new()),
            flow_registered: Condvar::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register a flow with its inbound streams. Streams still unconnected
    /// after `timeout` receive a deadline-exceeded error; if the flow's
    /// context is canceled first they receive a canceled error instead.
    pub fn register_flow(
        self: &Arc<Self>,
        id: FlowId,
        ctx: Context,
        inbound_streams: HashMap<StreamId, InboundStreamInfo>,
        timeout: Duration,
    ) -> Result<()> {
        let mut flows = self.flows.lock();
        if flows.contains_key(&id) {
            return Err(FlowError::FlowAlreadyRegistered(id));
        }

        let stop_timer = if inbound_streams.is_empty() {
            None
        } else {
            let (stop_tx, stop_rx) = channel::bounded::<()>(0);
            let registry = Arc::downgrade(self);
            let flow_ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("flow-timeout-{}", id.short()))
                .spawn(move || {
                    select! {
                        recv(stop_rx) -> _ => {},
                        recv(flow_ctx.done()) -> _ => {
                            if let Some(registry) = registry.upgrade() {
                                registry.cancel_pending_streams(id);
                            }
                        },
                        default(timeout) => {
                            if let Some(registry) = registry.upgrade() {
                                registry.handle_timeout(id, timeout);
                            }
                        },
                    }
                })?;
            Some(stop_tx)
        };

        debug!(
            "node {}: registered flow {} with {} inbound streams (timeout {:?})",
            self.node_id,
            id.short(),
            inbound_streams.len(),
            timeout
        );
        flows.insert(
            id,
            FlowEntry {
                ctx,
                inbound_streams,
                stop_timer,
            },
        );
        self.flow_registered.notify_all();
        Ok(())
    }

    fn handle_timeout(&self, id: FlowId, timeout: Duration) {
        let mut timed_out = Vec::new();
        {
            let mut flows = self.flows.lock();
            let Some(entry) = flows.get_mut(&id) else {
                return;
            };
            for (stream_id, info) in entry.inbound_streams.iter_mut() {
                if !info.connected && !info.finished {
                    let (receiver, wg) = info.abandon();
                    timed_out.push((*stream_id, receiver, wg));
                }
            }
            if entry.all_finished() {
                flows.remove(&id);
            }
        }

        for (stream_id, receiver, wg) in timed_out {
            warn!(
                "node {}: flow {}: inbound stream {} not connected within {:?}",
                self.node_id,
                id.short(),
                stream_id,
                timeout
            );
            receiver.push(Message::error(FlowError::DeadlineExceeded { flow_id: id, stream_id }));
            receiver.producer_done();
            drop(wg);
        }
    }

    /// Connect a remote producer to its registered inbound stream
    pub fn connect_inbound_stream(self: &Arc<Self>, flow_id: FlowId, stream_id: StreamId) -> Result<ConnectedStream> {
        let mut flows = self.flows.lock();
        self.connect_locked(&mut flows, flow_id, stream_id)
    }

    /// Like `connect_inbound_stream`, but waits up to `timeout` for the flow
    /// to be registered; producers may dial before their consumer is set up.
    pub fn connect_inbound_stream_wait(
        self: &Arc<Self>,
        flow_id: FlowId,
        stream_id: StreamId,
        timeout: Duration,
    ) -> Result<ConnectedStream> {
        let deadline = Instant::now() + timeout;
        let mut flows = self.flows.lock();
        while !flows.contains_key(&flow_id) {
            if self.flow_registered.wait_until(&mut flows, deadline).timed_out() {
                break;
            }
        }
        self.connect_locked(&mut flows, flow_id, stream_id)
    }

    fn connect_locked(
        self: &Arc<Self>,
        flows: &mut HashMap<FlowId, FlowEntry>,
        flow_id: FlowId,
        stream_id: StreamId,
    ) -> Result<ConnectedStream> {
        let entry = flows.get_mut(&flow_id).ok_or(FlowError::UnknownFlow(flow_id))?;
        let info = entry
            .inbound_streams
            .get_mut(&stream_id)
            .ok_or(FlowError::UnknownStream { flow_id, stream_id })?;
        if info.canceled {
            return Err(FlowError::StreamCanceled { flow_id, stream_id });
        }
        if info.connected {
            return Err(FlowError::StreamAlreadyConnected { flow_id, stream_id });
        }
        info.connected = true;
        debug!("node {}: flow {}: inbound stream {} connected", self.node_id, flow_id.short(), stream_id);

        Ok(ConnectedStream {
            flow_id,
            stream_id,
            receiver: Arc::clone(&info.receiver),
            ctx: entry.ctx.clone(),
            registry: Arc::clone(self),
            finished: false,
        })
    }

    /// Mark a connected stream finished, releasing its share of the flow's
    /// completion counter.
    fn finish_inbound_stream(&self, flow_id: FlowId, stream_id: StreamId) {
        let wg = {
            let mut flows = self.flows.lock();
            flows
                .get_mut(&flow_id)
                .and_then(|entry| entry.inbound_streams.get_mut(&stream_id))
                .and_then(|info| {
                    info.finished = true;
                    info.wait_group.take()
                })
        };
        drop(wg);
    }

    /// Cancel every inbound stream of the flow that never connected: late
    /// connections are rejected and the stream's receiver is told the query
    /// was canceled. Returns the number of streams canceled.
    pub fn cancel_pending_streams(&self, flow_id: FlowId) -> usize {
        let mut canceled = Vec::new();
        {
            let mut flows = self.flows.lock();
            let Some(entry) = flows.get_mut(&flow_id) else {
                return 0;
            };
            for (stream_id, info) in entry.inbound_streams.iter_mut() {
                if !info.connected && !info.finished {
                    let (receiver, wg) = info.abandon();
                    canceled.push((*stream_id, receiver, wg));
                }
            }
        }

        let count = canceled.len();
        for (stream_id, receiver, wg) in canceled {
            debug!("node {}: flow {}: canceling inbound stream {}", self.node_id, flow_id.short(), stream_id);
            receiver.push(Message::error(FlowError::QueryCanceled));
            receiver.producer_done();
            drop(wg);
        }
        count
    }

    /// Remove a flow. Streams still connected keep running; their finish
    /// becomes a no-op.
    pub fn unregister_flow(&self, id: FlowId) {
        let entry = self.flows.lock().remove(&id);
        if let Some(mut entry) = entry {
            entry.stop_timer.take();
            info!("node {}: unregistered flow {}", self.node_id, id.short());
        }
    }

    pub fn is_registered(&self, id: FlowId) -> bool {
        self.flows.lock().contains_key(&id)
    }

    pub fn num_flows(&self) -> usize {
        self.flows.lock().len()
    }
}

/// A connected inbound stream, handed to whoever serves it. Finishing it
/// (explicitly or by dropping it) signals `producer_done` on the receiver
/// exactly once and updates the registry.
pub struct ConnectedStream {
    flow_id: FlowId,
    stream_id: StreamId,
    receiver: Arc<dyn RowReceiver>,
    ctx: Context,
    registry: Arc<FlowRegistry>,
    finished: bool,
}

impl ConnectedStream {
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn receiver(&self) -> &Arc<dyn RowReceiver> {
        &self.receiver
    }

    /// The consuming flow's context
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn finish(mut self) {
        self.finish_once();
    }

    fn finish_once(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.receiver.producer_done();
        self.registry.finish_inbound_stream(self.flow_id, self.stream_id);
    }
}

impl Drop for ConnectedStream {
    fn drop(&mut self) {
        self.finish_once();
    }
}
