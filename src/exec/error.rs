// Flow Error Types
//
// Every error the runtime produces or transports. Errors travel as producer
// metadata through the same channels rows do, so the type is clonable and
// serializable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{FlowId, NodeId, ProcessorId, StreamId};

/// Errors raised while setting up, running or tearing down a flow
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowError {
    // Structural errors, detected during setup
    #[error("input sync with no streams")]
    InputSyncWithoutStreams,

    #[error("inbound stream {0} of type SYNC_RESPONSE")]
    SyncResponseInbound(StreamId),

    #[error("inbound stream {0} has multiple consumers")]
    MultipleInboundConsumers(StreamId),

    #[error("local stream {0} has multiple consumers")]
    MultipleLocalConsumers(StreamId),

    #[error("stream {0} has multiple connections")]
    MultipleConnections(StreamId),

    #[error("unconnected inbound stream {0}")]
    UnconnectedStream(StreamId),

    #[error("local stream {0} has no producer")]
    NoProducer(StreamId),

    #[error("only single-output processors supported, processor {processor} has {outputs}")]
    OutputArity { processor: ProcessorId, outputs: usize },

    #[error("expected one stream for passthrough router, got {0}")]
    PassThroughArity(usize),

    #[error("remote stream {0} has no target node")]
    MissingTargetNode(StreamId),

    #[error("expected {expected} input(s), got {actual}")]
    InputArity { expected: usize, actual: usize },

    #[error("invalid flow spec: {0}")]
    InvalidSpec(String),

    // Registry errors
    #[error("flow {0} already registered")]
    FlowAlreadyRegistered(FlowId),

    #[error("flow {0} not found")]
    UnknownFlow(FlowId),

    #[error("flow {flow_id}: stream {stream_id} not found")]
    UnknownStream { flow_id: FlowId, stream_id: StreamId },

    #[error("flow {flow_id}: inbound stream {stream_id} already connected")]
    StreamAlreadyConnected { flow_id: FlowId, stream_id: StreamId },

    #[error("flow {flow_id}: inbound stream {stream_id} canceled")]
    StreamCanceled { flow_id: FlowId, stream_id: StreamId },

    // Synthesized by the runtime itself
    #[error("query execution canceled")]
    QueryCanceled,

    #[error("flow {flow_id}: no inbound stream connection for stream {stream_id} (deadline exceeded)")]
    DeadlineExceeded { flow_id: FlowId, stream_id: StreamId },

    // Runtime errors raised by processors
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("column index {index} out of range for row of width {width}")]
    ColumnOutOfRange { index: usize, width: usize },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("memory budget exceeded on monitor {monitor}: requested {requested} bytes, budget {budget}")]
    MemoryBudgetExceeded { monitor: String, requested: u64, budget: u64 },

    // Network glue
    #[error("transport error talking to node {node}: {message}")]
    Transport { node: NodeId, message: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// The query was canceled, locally or by a peer
    pub fn is_canceled(&self) -> bool {
        matches!(self, FlowError::QueryCanceled | FlowError::StreamCanceled { .. })
    }

    /// A remote stream never connected in time
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, FlowError::DeadlineExceeded { .. })
    }

    /// Malformed plan, detected before anything runs
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FlowError::InputSyncWithoutStreams
                | FlowError::SyncResponseInbound(_)
                | FlowError::MultipleInboundConsumers(_)
                | FlowError::MultipleLocalConsumers(_)
                | FlowError::MultipleConnections(_)
                | FlowError::UnconnectedStream(_)
                | FlowError::NoProducer(_)
                | FlowError::OutputArity { .. }
                | FlowError::PassThroughArity(_)
                | FlowError::MissingTargetNode(_)
                | FlowError::InputArity { .. }
                | FlowError::InvalidSpec(_)
        )
    }
}

impl From<bincode::Error> for FlowError {
    fn from(err: bincode::Error) -> Self {
        FlowError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::Internal(format!("I/O error: {}", err))
    }
}

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
