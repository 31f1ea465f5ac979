// Flow
//
// Builds one node's portion of a query from its spec, schedules it and
// tears it down.
//
// Setup creates the input synchronizers of every processor first, then the
// processors themselves in spec order, resolving each output to the sync
// response consumer, a local row channel, an outbox, or a router over
// several of those. Processors picked by the fusion pass are not scheduled;
// they become the input source of their consumer instead.
//
// Every task the flow starts (processors, router outputs, outboxes) and
// every inbound stream holds a clone of the flow's wait group, so `wait`
// returns once all of them are done.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use linked_hash_map::LinkedHashMap;
use log::{debug, error, info};

use crate::common::context::{CancelHandle, Context};
use crate::common::types::{FlowId, StreamId};
use crate::exec::error::{FlowError, Result};
use crate::exec::processors::{new_processor, Processor};
use crate::exec::receiver::{AccountClearingRowReceiver, CopyingRowReceiver, Message, RowReceiver, RowSource};
use crate::exec::router::Router;
use crate::exec::sync::{row_channel, OrderedSynchronizer};
use crate::flow::ctx::FlowCtx;
use crate::flow::graph::{FlowGraph, FusionPlan};
use crate::flow::outbox::Outbox;
use crate::flow::registry::{FlowRegistry, InboundStreamInfo};
use crate::flow::spec::{FlowSpec, InputSyncSpec, ProcessorSpec, RouterType, StreamEndpointSpec, StreamType, SyncType};
use crate::flow::Startable;

/// Lifecycle of a flow; it only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    NotStarted,
    Running,
    Finished,
}

pub struct Flow {
    flow_ctx: Arc<FlowCtx>,
    registry: Arc<FlowRegistry>,

    /// Processors that get a task of their own, in spec order
    processors: Vec<Processor>,
    /// Routers and outboxes
    startables: Vec<Arc<dyn Startable>>,
    sync_flow_consumer: Option<Arc<dyn RowReceiver>>,

    /// Local streams whose consumer is set up, mapped to the receiver a
    /// producer will push into; `None` once a producer took it
    local_streams: LinkedHashMap<StreamId, Option<Arc<dyn RowReceiver>>>,
    /// Remote streams not yet handed to the registry
    inbound_streams: HashMap<StreamId, InboundStreamInfo>,

    wait_group: Option<WaitGroup>,
    status: FlowStatus,
    ctx: Option<Context>,
    cancel: Option<CancelHandle>,
    registered: bool,
    fused: usize,
    done_fn: Option<Box<dyn FnOnce() + Send>>,
    cleaned_up: bool,
}

impl Flow {
    pub fn new(
        flow_ctx: Arc<FlowCtx>,
        registry: Arc<FlowRegistry>,
        sync_flow_consumer: Option<Arc<dyn RowReceiver>>,
    ) -> Self {
        Flow {
            flow_ctx,
            registry,
            processors: Vec::new(),
            startables: Vec::new(),
            sync_flow_consumer,
            local_streams: LinkedHashMap::new(),
            inbound_streams: HashMap::new(),
            wait_group: Some(WaitGroup::new()),
            status: FlowStatus::NotStarted,
            ctx: None,
            cancel: None,
            registered: false,
            fused: 0,
            done_fn: None,
            cleaned_up: false,
        }
    }

    /// Callback invoked exactly once by `cleanup`
    pub fn with_done_fn(mut self, done_fn: impl FnOnce() + Send + 'static) -> Self {
        self.done_fn = Some(Box::new(done_fn));
        self
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_ctx.flow_id
    }

    pub fn flow_ctx(&self) -> &Arc<FlowCtx> {
        &self.flow_ctx
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    /// Processors scheduled on tasks of their own
    pub fn num_processors(&self) -> usize {
        self.processors.len()
    }

    /// Processors running inside their consumer's task
    pub fn num_fused(&self) -> usize {
        self.fused
    }

    pub fn num_inbound_streams(&self) -> usize {
        self.inbound_streams.len()
    }

    /// Handle canceling everything the flow started; set once started
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.cancel.clone()
    }

    /// Build the flow's graph. All errors are structural: the flow spec is
    /// malformed and retrying will not help.
    pub fn setup(&mut self, spec: &FlowSpec) -> Result<()> {
        let fusion = if self.flow_ctx.testing_knobs.disable_fusion {
            FusionPlan::default()
        } else {
            FlowGraph::from_spec(spec).plan_fusion()
        };

        let mut inputs: Vec<Vec<Option<Box<dyn RowSource>>>> = Vec::with_capacity(spec.processors.len());
        for pspec in &spec.processors {
            let mut syncs = Vec::with_capacity(pspec.input.len());
            for input in &pspec.input {
                syncs.push(Some(self.setup_input(input)?));
            }
            inputs.push(syncs);
        }

        for (idx, pspec) in spec.processors.iter().enumerate() {
            let output = self.setup_router(pspec)?;
            let proc_inputs = inputs[idx]
                .iter_mut()
                .map(|input| {
                    input
                        .take()
                        .ok_or_else(|| FlowError::Internal(format!("input of processor {} used twice", pspec.processor_id)))
                })
                .collect::<Result<Vec<_>>>()?;
            let proc = new_processor(&self.flow_ctx, pspec, proc_inputs, output)?;

            match fusion.consumer_of(idx) {
                Some((consumer, port)) => {
                    debug!(
                        "flow {}: fusing processor {} into processor {}",
                        self.flow_id().short(),
                        pspec.processor_id,
                        spec.processors[consumer].processor_id
                    );
                    inputs[consumer][port] = Some(proc.into_source());
                    self.fused += 1;
                }
                None => self.processors.push(proc),
            }
        }

        if let Some((stream_id, _)) = self.local_streams.iter().find(|(_, r)| r.is_some()) {
            return Err(FlowError::NoProducer(*stream_id));
        }
        debug!(
            "flow {}: set up {} processors ({} fused), {} startables, {} inbound streams",
            self.flow_id().short(),
            self.processors.len(),
            self.fused,
            self.startables.len(),
            self.inbound_streams.len()
        );
        Ok(())
    }

    fn setup_input(&mut self, spec: &InputSyncSpec) -> Result<Box<dyn RowSource>> {
        if spec.streams.is_empty() {
            return Err(FlowError::InputSyncWithoutStreams);
        }
        let capacity = self.flow_ctx.settings.row_channel_capacity;
        match spec.sync_type {
            SyncType::Unordered => {
                let (tx, rx) = row_channel(spec.streams.len(), capacity);
                for stream in &spec.streams {
                    self.setup_inbound_stream(stream, tx.clone())?;
                }
                Ok(Box::new(rx))
            }
            SyncType::Ordered => {
                let mut sources: Vec<Box<dyn RowSource>> = Vec::with_capacity(spec.streams.len());
                for stream in &spec.streams {
                    let (tx, rx) = row_channel(1, capacity);
                    self.setup_inbound_stream(stream, tx)?;
                    sources.push(Box::new(rx));
                }
                Ok(Box::new(OrderedSynchronizer::new(spec.ordering.clone(), sources)))
            }
        }
    }

    fn setup_inbound_stream(&mut self, spec: &StreamEndpointSpec, receiver: Arc<dyn RowReceiver>) -> Result<()> {
        let sid = spec.stream_id;
        match spec.stream_type {
            StreamType::SyncResponse => Err(FlowError::SyncResponseInbound(sid)),
            StreamType::Remote => {
                if self.inbound_streams.contains_key(&sid) {
                    return Err(FlowError::MultipleInboundConsumers(sid));
                }
                let wg = self
                    .wait_group
                    .as_ref()
                    .ok_or_else(|| FlowError::Internal("flow already waited on".to_string()))?
                    .clone();
                self.inbound_streams.insert(sid, InboundStreamInfo::new(receiver, wg));
                Ok(())
            }
            StreamType::Local => {
                if self.local_streams.contains_key(&sid) {
                    return Err(FlowError::MultipleLocalConsumers(sid));
                }
                self.local_streams.insert(sid, Some(receiver));
                Ok(())
            }
        }
    }

    fn setup_outbound_stream(&mut self, spec: &StreamEndpointSpec) -> Result<Arc<dyn RowReceiver>> {
        let sid = spec.stream_id;
        match spec.stream_type {
            StreamType::SyncResponse => {
                let consumer = self
                    .sync_flow_consumer
                    .clone()
                    .ok_or_else(|| FlowError::InvalidSpec("sync-response stream but no consumer".to_string()))?;
                Ok(Arc::new(AccountClearingRowReceiver::new(
                    consumer,
                    Arc::clone(&self.flow_ctx.eval_account),
                )))
            }
            StreamType::Remote => {
                let node = spec.target_node.ok_or(FlowError::MissingTargetNode(sid))?;
                let outbox = Arc::new(Outbox::new(&self.flow_ctx, sid, node)?);
                self.startables.push(outbox.clone());
                Ok(outbox)
            }
            StreamType::Local => match self.local_streams.get_mut(&sid) {
                None => Err(FlowError::UnconnectedStream(sid)),
                Some(slot) => slot.take().ok_or(FlowError::MultipleConnections(sid)),
            },
        }
    }

    /// Resolve a processor's output to a single receiver
    fn setup_router(&mut self, spec: &ProcessorSpec) -> Result<Arc<dyn RowReceiver>> {
        let [output] = spec.output.as_slice() else {
            return Err(FlowError::OutputArity {
                processor: spec.processor_id,
                outputs: spec.output.len(),
            });
        };
        if output.router_type == RouterType::PassThrough {
            let [stream] = output.streams.as_slice() else {
                return Err(FlowError::PassThroughArity(output.streams.len()));
            };
            let receiver = self.setup_outbound_stream(stream)?;
            return Ok(Arc::new(CopyingRowReceiver::new(receiver)));
        }

        let mut streams: Vec<Arc<dyn RowReceiver>> = Vec::with_capacity(output.streams.len());
        for stream in &output.streams {
            let receiver = self.setup_outbound_stream(stream)?;
            streams.push(Arc::new(CopyingRowReceiver::new(receiver)));
        }
        let router = Arc::new(Router::new(
            self.flow_id(),
            &output.router_type,
            streams,
            &self.flow_ctx.monitor,
        )?);
        self.startables.push(router.clone());
        Ok(router)
    }

    /// Start everything but the last processor, which is returned
    fn start_internal(&mut self, parent: &Context) -> Result<Option<Processor>> {
        if self.status != FlowStatus::NotStarted {
            return Err(FlowError::Internal(format!("flow {} started twice", self.flow_id())));
        }
        let (ctx, cancel) = parent.with_cancel();
        self.ctx = Some(ctx.clone());
        self.cancel = Some(cancel.clone());
        self.status = FlowStatus::Running;
        info!(
            "node {}: starting flow {} ({} processors)",
            self.flow_ctx.node_id,
            self.flow_id().short(),
            self.processors.len()
        );

        let wg = self
            .wait_group
            .as_ref()
            .ok_or_else(|| FlowError::Internal("flow already waited on".to_string()))?
            .clone();

        if !self.inbound_streams.is_empty() {
            let streams = std::mem::take(&mut self.inbound_streams);
            self.registry.register_flow(
                self.flow_id(),
                ctx.clone(),
                streams,
                self.flow_ctx.settings.flow_stream_timeout(),
            )?;
            self.registered = true;
        }

        for startable in &self.startables {
            Arc::clone(startable).start(&ctx, &wg, &cancel)?;
        }

        let mut processors = std::mem::take(&mut self.processors);
        let last = processors.pop();
        for proc in processors {
            self.spawn_processor(proc, &ctx, &wg)?;
        }
        Ok(last)
    }

    fn spawn_processor(&self, proc: Processor, ctx: &Context, wg: &WaitGroup) -> Result<()> {
        let ctx = ctx.clone();
        let wg = wg.clone();
        thread::Builder::new()
            .name(format!("proc-{}-{}", self.flow_id().short(), proc.id()))
            .spawn(move || {
                proc.run(&ctx);
                drop(wg);
            })?;
        Ok(())
    }

    /// A flow with a sync-response consumer reports start failures through
    /// it; other flows return them.
    fn handle_start_error(&mut self, err: FlowError) -> Result<()> {
        error!("flow {}: failed to start: {}", self.flow_id().short(), err);
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        match &self.sync_flow_consumer {
            Some(consumer) => {
                consumer.push(Message::error(err));
                consumer.producer_done();
                Ok(())
            }
            None => Err(err),
        }
    }

    /// An empty flow has no producer for its consumer; end the result
    /// stream right away.
    fn finish_empty(&self) {
        if let Some(consumer) = &self.sync_flow_consumer {
            consumer.producer_done();
        }
    }

    /// Start every task, the last processor included, and return
    pub fn start_async(&mut self, parent: &Context) -> Result<()> {
        let last = match self.start_internal(parent) {
            Ok(last) => last,
            Err(err) => return self.handle_start_error(err),
        };
        let (Some(proc), Some(ctx)) = (last, self.ctx.clone()) else {
            self.finish_empty();
            return Ok(());
        };
        let wg = match &self.wait_group {
            Some(wg) => wg.clone(),
            None => return Err(FlowError::Internal("flow already waited on".to_string())),
        };
        if let Err(err) = self.spawn_processor(proc, &ctx, &wg) {
            return self.handle_start_error(err);
        }
        Ok(())
    }

    /// Start every task but the last processor, then run that one on the
    /// calling thread. `wait` must still be called afterwards.
    pub fn start_sync(&mut self, parent: &Context) -> Result<()> {
        let last = match self.start_internal(parent) {
            Ok(last) => last,
            Err(err) => return self.handle_start_error(err),
        };
        match (last, self.ctx.clone()) {
            (Some(proc), Some(ctx)) => proc.run(&ctx),
            _ => self.finish_empty(),
        }
        Ok(())
    }

    /// Block until every task of the flow is done. If the flow's context is
    /// canceled first, unblock the inbound streams that never connected and
    /// keep waiting; tasks are never abandoned.
    pub fn wait(&mut self) {
        // Streams never registered still hold a share of the wait group.
        self.inbound_streams.clear();
        let Some(wg) = self.wait_group.take() else {
            return;
        };
        let Some(ctx) = self.ctx.clone() else {
            wg.wait();
            return;
        };

        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let waiter = thread::Builder::new()
            .name(format!("flow-wait-{}", self.flow_id().short()))
            .spawn(move || {
                wg.wait();
                let _ = done_tx.send(());
            });
        if let Err(err) = waiter {
            error!("flow {}: cannot wait for tasks: {}", self.flow_id().short(), err);
            return;
        }

        select! {
            recv(done_rx) -> _ => {},
            recv(ctx.done()) -> _ => {
                self.cancel_pending_streams();
                let _ = done_rx.recv();
            },
        }
        debug!("flow {}: all tasks done", self.flow_id().short());
    }

    /// Unblock the receivers of inbound streams no peer connected. Streams
    /// already connected unwind through their own context handling.
    fn cancel_pending_streams(&self) {
        if !self.registered {
            return;
        }
        let canceled = self.registry.cancel_pending_streams(self.flow_id());
        info!("flow {}: canceled, {} pending inbound streams unblocked", self.flow_id().short(), canceled);
    }

    /// Release the flow's resources. Calling it twice is a bug.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            panic!("flow cleanup called twice");
        }
        self.cleaned_up = true;

        self.flow_ctx.eval_account.close();
        if self.registered {
            self.registry.unregister_flow(self.flow_id());
            self.registered = false;
        }
        self.status = FlowStatus::Finished;
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        info!("node {}: flow {} finished", self.flow_ctx.node_id, self.flow_id().short());
        if let Some(done_fn) = self.done_fn.take() {
            done_fn();
        }
    }
}
