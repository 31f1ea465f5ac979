// In-Process Network
//
// Connects several nodes living in one process. Each stream is a pair of
// crossbeam channels; the serving side runs on a thread of its own, the way
// an RPC server would run a handler.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::common::context::Context;
use crate::common::types::NodeId;
use crate::exec::error::{FlowError, Result};
use crate::flow::spec::FlowSpec;
use crate::net::transport::{Dialer, FlowService, InboundConn, OutboundConn};

/// Frames buffered per stream before the producer blocks
const STREAM_BUFFER_FRAMES: usize = 8;

/// A registry of in-process nodes, usable as every node's dialer
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<dyn FlowService>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node reachable. The network does not keep it alive.
    pub fn register(&self, node: NodeId, service: &Arc<dyn FlowService>) {
        self.nodes.write().insert(node, Arc::downgrade(service));
    }

    pub fn unregister(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    fn lookup(&self, node: NodeId) -> Result<Arc<dyn FlowService>> {
        self.nodes
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| FlowError::Transport {
                node,
                message: "node unreachable".to_string(),
            })
    }
}

impl Dialer for LocalNetwork {
    fn setup_remote_flow(&self, node: NodeId, spec: FlowSpec) -> Result<()> {
        self.lookup(node)?.setup_flow(spec)
    }

    fn open_flow_stream(&self, node: NodeId) -> Result<Box<dyn OutboundConn>> {
        let service = self.lookup(node)?;
        let (frame_tx, frame_rx) = channel::bounded(STREAM_BUFFER_FRAMES);
        let (signal_tx, signal_rx) = channel::unbounded();

        let inbound = LocalInboundConn {
            frames: frame_rx,
            signals: signal_tx,
        };
        thread::Builder::new()
            .name(format!("flow-stream-n{}", node))
            .spawn(move || {
                if let Err(err) = service.flow_stream(Box::new(inbound)) {
                    warn!("node {}: inbound stream failed: {}", node, err);
                }
            })?;
        debug!("opened stream to node {}", node);

        Ok(Box::new(LocalOutboundConn {
            node,
            frames: frame_tx,
            signals: signal_rx,
        }))
    }
}

struct LocalOutboundConn {
    node: NodeId,
    frames: Sender<Vec<u8>>,
    signals: Receiver<Vec<u8>>,
}

impl OutboundConn for LocalOutboundConn {
    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.frames.send(frame).map_err(|_| FlowError::Transport {
            node: self.node,
            message: "stream closed by consumer".to_string(),
        })
    }

    fn signals(&self) -> Receiver<Vec<u8>> {
        self.signals.clone()
    }
}

struct LocalInboundConn {
    frames: Receiver<Vec<u8>>,
    signals: Sender<Vec<u8>>,
}

impl InboundConn for LocalInboundConn {
    fn recv(&mut self, ctx: &Context) -> Result<Option<Vec<u8>>> {
        select! {
            recv(self.frames) -> frame => Ok(frame.ok()),
            recv(ctx.done()) -> _ => Err(FlowError::QueryCanceled),
        }
    }

    fn send_signal(&mut self, signal: Vec<u8>) -> Result<()> {
        // A producer that already left no longer cares.
        let _ = self.signals.send(signal);
        Ok(())
    }
}
