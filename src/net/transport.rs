// Transport Interfaces
//
// The RPC surface flows use to reach other nodes. A node exposes a
// `FlowService`; other nodes reach it through a `Dialer`. Streams are
// bidirectional: frames travel producer to consumer, signals travel back.

use crossbeam::channel::Receiver;

use crate::common::context::Context;
use crate::common::types::NodeId;
use crate::exec::error::Result;
use crate::flow::spec::FlowSpec;

/// Producer end of a stream connection
pub trait OutboundConn: Send {
    /// Send one encoded frame, blocking while the peer is behind
    fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Encoded signals from the consumer; disconnected once it hangs up
    fn signals(&self) -> Receiver<Vec<u8>>;
}

/// Consumer end of a stream connection
pub trait InboundConn: Send {
    /// Next encoded frame, waiting at most until the context is canceled.
    /// `Ok(None)` means the producer hung up.
    fn recv(&mut self, ctx: &Context) -> Result<Option<Vec<u8>>>;

    fn send_signal(&mut self, signal: Vec<u8>) -> Result<()>;
}

/// What a node serves to its peers
pub trait FlowService: Send + Sync {
    /// Set up and start a flow on behalf of the gateway
    fn setup_flow(&self, spec: FlowSpec) -> Result<()>;

    /// Serve one inbound stream until it ends
    fn flow_stream(&self, conn: Box<dyn InboundConn>) -> Result<()>;
}

/// How a node reaches its peers
pub trait Dialer: Send + Sync {
    fn setup_remote_flow(&self, node: NodeId, spec: FlowSpec) -> Result<()>;

    /// Open a stream to `node`; the peer serves it with `flow_stream`
    fn open_flow_stream(&self, node: NodeId) -> Result<Box<dyn OutboundConn>>;
}
