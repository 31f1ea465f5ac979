// Flow Specifications
//
// The declarative description of one node's share of a distributed query:
// processors, their input synchronizers and output routers, and the stream
// endpoints connecting them. Specs are produced by the plan compiler and
// shipped to remote nodes, so every type here is serializable.

use serde::{Deserialize, Serialize};

use crate::common::types::{FlowId, NodeId, ProcessorId, StreamId};
use crate::exec::expr::Expr;
use crate::exec::row::{ColumnOrdering, DataValue};

/// One node's portion of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub flow_id: FlowId,
    /// Node that issued the query and owns the sync-response consumer
    pub gateway: NodeId,
    pub processors: Vec<ProcessorSpec>,
}

impl FlowSpec {
    pub fn new(flow_id: FlowId, gateway: NodeId) -> Self {
        FlowSpec {
            flow_id,
            gateway,
            processors: Vec::new(),
        }
    }

    pub fn with_processor(mut self, processor: ProcessorSpec) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// One processing stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub processor_id: ProcessorId,
    pub core: ProcessorCoreSpec,
    pub post: PostProcessSpec,
    pub input: Vec<InputSyncSpec>,
    pub output: Vec<OutputRouterSpec>,
}

impl ProcessorSpec {
    pub fn new(processor_id: ProcessorId, core: ProcessorCoreSpec) -> Self {
        ProcessorSpec {
            processor_id,
            core,
            post: PostProcessSpec::default(),
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: InputSyncSpec) -> Self {
        self.input.push(input);
        self
    }

    pub fn with_output(mut self, output: OutputRouterSpec) -> Self {
        self.output.push(output);
        self
    }

    pub fn with_post(mut self, post: PostProcessSpec) -> Self {
        self.post = post;
        self
    }
}

/// The computation a processor performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessorCoreSpec {
    /// Emit literal rows
    Values { rows: Vec<Vec<DataValue>> },
    /// Scan a table of the node's catalog, optionally restricted to the row
    /// range `[start, end)`
    TableReader {
        table: String,
        start: Option<usize>,
        end: Option<usize>,
    },
    /// Forward the input unchanged
    Noop,
    /// Keep rows for which the expression is TRUE
    Filterer { filter: Expr },
    /// Sort the whole input
    Sorter { ordering: ColumnOrdering },
}

impl ProcessorCoreSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorCoreSpec::Values { .. } => "values",
            ProcessorCoreSpec::TableReader { .. } => "table-reader",
            ProcessorCoreSpec::Noop => "noop",
            ProcessorCoreSpec::Filterer { .. } => "filterer",
            ProcessorCoreSpec::Sorter { .. } => "sorter",
        }
    }

    /// Number of inputs the core consumes
    pub fn num_inputs(&self) -> usize {
        match self {
            ProcessorCoreSpec::Values { .. } | ProcessorCoreSpec::TableReader { .. } => 0,
            ProcessorCoreSpec::Noop | ProcessorCoreSpec::Filterer { .. } | ProcessorCoreSpec::Sorter { .. } => 1,
        }
    }
}

/// Work applied to every row a processor emits, in order: filter, offset,
/// limit, projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessSpec {
    pub filter: Option<Expr>,
    /// Output columns, by ordinal; `None` keeps every column
    pub projection: Option<Vec<usize>>,
    pub offset: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    Unordered,
    Ordered,
}

/// How the streams feeding one processor input are combined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSyncSpec {
    pub sync_type: SyncType,
    /// Merge ordering; only meaningful for ordered inputs
    pub ordering: ColumnOrdering,
    pub streams: Vec<StreamEndpointSpec>,
}

impl InputSyncSpec {
    pub fn unordered(streams: Vec<StreamEndpointSpec>) -> Self {
        InputSyncSpec {
            sync_type: SyncType::Unordered,
            ordering: ColumnOrdering::default(),
            streams,
        }
    }

    pub fn ordered(ordering: ColumnOrdering, streams: Vec<StreamEndpointSpec>) -> Self {
        InputSyncSpec {
            sync_type: SyncType::Ordered,
            ordering,
            streams,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    /// Terminal output returned directly to the query issuer
    SyncResponse,
    /// Both ends live on this node
    Local,
    /// The other end lives on `target_node`
    Remote,
}

/// One end of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEndpointSpec {
    pub stream_type: StreamType,
    pub stream_id: StreamId,
    /// Peer node of a remote stream
    pub target_node: Option<NodeId>,
}

impl StreamEndpointSpec {
    pub fn sync_response() -> Self {
        StreamEndpointSpec {
            stream_type: StreamType::SyncResponse,
            stream_id: 0,
            target_node: None,
        }
    }

    pub fn local(stream_id: StreamId) -> Self {
        StreamEndpointSpec {
            stream_type: StreamType::Local,
            stream_id,
            target_node: None,
        }
    }

    pub fn remote(stream_id: StreamId, target_node: NodeId) -> Self {
        StreamEndpointSpec {
            stream_type: StreamType::Remote,
            stream_id,
            target_node: Some(target_node),
        }
    }
}

/// A `[start, end)` key range routed to one output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSpan {
    pub start: Vec<DataValue>,
    pub end: Vec<DataValue>,
    /// Index into the router's stream list
    pub stream: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RouterType {
    /// Exactly one stream, no router object
    PassThrough,
    /// Every row goes to every stream
    Mirror,
    /// Rows go to the stream picked by hashing `hash_columns`
    ByHash { hash_columns: Vec<usize> },
    /// Rows go to the stream whose span contains the key formed by
    /// `columns`; spans are sorted and do not overlap
    ByRange {
        columns: Vec<usize>,
        spans: Vec<RangeSpan>,
        default_stream: Option<usize>,
    },
}

/// How a processor output is distributed to its streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRouterSpec {
    pub router_type: RouterType,
    pub streams: Vec<StreamEndpointSpec>,
}

impl OutputRouterSpec {
    pub fn pass_through(stream: StreamEndpointSpec) -> Self {
        OutputRouterSpec {
            router_type: RouterType::PassThrough,
            streams: vec![stream],
        }
    }

    pub fn mirror(streams: Vec<StreamEndpointSpec>) -> Self {
        OutputRouterSpec {
            router_type: RouterType::Mirror,
            streams,
        }
    }

    pub fn by_hash(hash_columns: Vec<usize>, streams: Vec<StreamEndpointSpec>) -> Self {
        OutputRouterSpec {
            router_type: RouterType::ByHash { hash_columns },
            streams,
        }
    }

    pub fn by_range(
        columns: Vec<usize>,
        spans: Vec<RangeSpan>,
        default_stream: Option<usize>,
        streams: Vec<StreamEndpointSpec>,
    ) -> Self {
        OutputRouterSpec {
            router_type: RouterType::ByRange {
                columns,
                spans,
                default_stream,
            },
            streams,
        }
    }
}
