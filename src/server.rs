// Flow Server
//
// One per node. Owns what the node's flows share (settings, the flow
// registry, the table catalog, the memory monitor and the dialer) and
// serves the two calls peers make: setting up a flow on behalf of a
// gateway and connecting an inbound stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::catalog::TableCatalog;
use crate::common::context::{CancelHandle, Context};
use crate::common::memory::MemoryMonitor;
use crate::common::settings::Settings;
use crate::common::types::{FlowId, NodeId};
use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::{Message, RowReceiver};
use crate::flow::inbound::process_inbound_stream;
use crate::flow::{Flow, FlowCtx, FlowRegistry, FlowSpec, TestingKnobs};
use crate::net::local::LocalNetwork;
use crate::net::transport::{Dialer, FlowService, InboundConn};
use crate::net::wire::{self, ProducerFrame};

pub struct FlowServer {
    node_id: NodeId,
    settings: Arc<Settings>,
    registry: Arc<FlowRegistry>,
    tables: Arc<TableCatalog>,
    monitor: Arc<MemoryMonitor>,
    dialer: Option<Arc<dyn Dialer>>,
    testing_knobs: TestingKnobs,

    /// Parent of every remote flow's context
    ctx: Context,
    shutdown: CancelHandle,
    remote_flows: Mutex<Vec<JoinHandle<()>>>,
    rows_received: AtomicU64,
}

impl FlowServer {
    pub fn new(node_id: NodeId, settings: Arc<Settings>) -> Self {
        let (ctx, shutdown) = Context::background().with_cancel();
        FlowServer {
            node_id,
            settings,
            registry: FlowRegistry::new(node_id),
            tables: Arc::new(TableCatalog::new()),
            monitor: MemoryMonitor::unlimited(format!("node-{}", node_id)),
            dialer: None,
            testing_knobs: TestingKnobs::default(),
            ctx,
            shutdown,
            remote_flows: Mutex::new(Vec::new()),
            rows_received: AtomicU64::new(0),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_tables(mut self, tables: Arc<TableCatalog>) -> Self {
        self.tables = tables;
        self
    }

    /// Limit the bytes all flows of the node may hold at once
    pub fn with_memory_budget(mut self, budget: u64) -> Self {
        self.monitor = MemoryMonitor::new(format!("node-{}", self.node_id), Some(budget));
        self
    }

    pub fn with_testing_knobs(mut self, knobs: TestingKnobs) -> Self {
        self.testing_knobs = knobs;
        self
    }

    /// Join an in-process network. The network only holds a weak reference.
    pub fn register_with(self: &Arc<Self>, network: &LocalNetwork) {
        let service: Arc<dyn FlowService> = self.clone();
        network.register(self.node_id, &service);
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn tables(&self) -> &Arc<TableCatalog> {
        &self.tables
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    /// Rows received over all inbound streams served so far
    pub fn rows_received(&self) -> u64 {
        self.rows_received.load(Ordering::Relaxed)
    }

    fn new_flow_ctx(&self, flow_id: FlowId) -> FlowCtx {
        let mut flow_ctx = FlowCtx::new(
            flow_id,
            self.node_id,
            Arc::clone(&self.settings),
            Arc::clone(&self.monitor),
            Arc::clone(&self.tables),
        )
        .with_testing_knobs(self.testing_knobs.clone());
        if let Some(dialer) = &self.dialer {
            flow_ctx = flow_ctx.with_dialer(Arc::clone(dialer));
        }
        flow_ctx
    }

    /// Build a flow from its spec without starting it
    pub fn setup_flow(&self, spec: &FlowSpec, consumer: Option<Arc<dyn RowReceiver>>) -> Result<Flow> {
        let flow_ctx = Arc::new(self.new_flow_ctx(spec.flow_id));
        let mut flow = Flow::new(flow_ctx, Arc::clone(&self.registry), consumer);
        if let Err(err) = flow.setup(spec) {
            error!("node {}: setting up flow {} failed: {}", self.node_id, spec.flow_id.short(), err);
            flow.cleanup();
            return Err(err);
        }
        Ok(flow)
    }

    /// Run a flow whose results go to `consumer`, returning once the flow
    /// is done. Any failure reaches the consumer as error metadata.
    pub fn run_sync_flow(&self, ctx: &Context, spec: &FlowSpec, consumer: Arc<dyn RowReceiver>) -> Result<()> {
        let mut flow = match self.setup_flow(spec, Some(Arc::clone(&consumer))) {
            Ok(flow) => flow,
            Err(err) => {
                consumer.push(Message::error(err));
                consumer.producer_done();
                return Ok(());
            }
        };
        let result = flow.start_sync(ctx);
        flow.wait();
        flow.cleanup();
        result
    }

    /// Join every remote flow started so far
    pub fn wait_remote_flows(&self) {
        let handles = std::mem::take(&mut *self.remote_flows.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("node {}: a remote flow panicked", self.node_id);
            }
        }
    }

    /// Cancel every remote flow still running and wait for them
    pub fn shutdown(&self) {
        info!("node {}: shutting down", self.node_id);
        self.shutdown.cancel();
        self.wait_remote_flows();
    }
}

impl FlowService for FlowServer {
    fn setup_flow(&self, spec: FlowSpec) -> Result<()> {
        let mut flow = FlowServer::setup_flow(self, &spec, None)?;
        if let Err(err) = flow.start_async(&self.ctx) {
            flow.wait();
            flow.cleanup();
            return Err(err);
        }

        let handle = thread::Builder::new()
            .name(format!("flow-{}-n{}", spec.flow_id.short(), self.node_id))
            .spawn(move || {
                flow.wait();
                flow.cleanup();
            })?;
        self.remote_flows.lock().push(handle);
        debug!("node {}: started remote flow {}", self.node_id, spec.flow_id.short());
        Ok(())
    }

    fn flow_stream(&self, mut conn: Box<dyn InboundConn>) -> Result<()> {
        let Some(frame) = conn.recv(&self.ctx)? else {
            return Err(FlowError::Codec("stream closed before its header".to_string()));
        };
        let ProducerFrame::Header { flow_id, stream_id } = wire::decode::<ProducerFrame>(&frame)? else {
            return Err(FlowError::Codec("stream did not start with a header".to_string()));
        };
        let stream = self
            .registry
            .connect_inbound_stream_wait(flow_id, stream_id, self.settings.flow_stream_timeout())?;
        process_inbound_stream(conn.as_mut(), stream, &self.rows_received)
    }
}

impl Drop for FlowServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
