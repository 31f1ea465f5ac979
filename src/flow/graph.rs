// Flow Graph
//
// An explicit view of a flow spec as a graph: processors are nodes, local
// streams are edges. The fusion pass runs over this graph before anything
// is built, so which processors get a task of their own can be inspected
// and tested on its own.
//
// A producer is fused into its consumer when its only output is a
// pass-through to a single local stream, and that stream is the sole stream
// of an unordered input of a processor later in the flow spec.

use std::collections::HashMap;

use crate::common::types::{ProcessorId, StreamId};
use crate::flow::spec::{FlowSpec, RouterType, StreamType, SyncType};

/// One end of a local stream: processor index and input or output index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub processor: usize,
    pub port: usize,
}

/// A local stream between two processors of the flow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEdge {
    pub stream_id: StreamId,
    pub producers: Vec<Endpoint>,
    pub consumers: Vec<Endpoint>,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub processor_id: ProcessorId,
    /// Single pass-through output to a local stream, if that is the
    /// processor's whole output
    fusable_output: Option<StreamId>,
    /// For every input: its streams and whether it is unordered
    inputs: Vec<(Vec<StreamId>, bool)>,
}

/// Processor index to the (consumer index, input index) it is fused into
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FusionPlan {
    fused: HashMap<usize, (usize, usize)>,
}

impl FusionPlan {
    pub fn consumer_of(&self, producer: usize) -> Option<(usize, usize)> {
        self.fused.get(&producer).copied()
    }

    pub fn is_fused(&self, producer: usize) -> bool {
        self.fused.contains_key(&producer)
    }

    pub fn len(&self) -> usize {
        self.fused.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fused.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: Vec<GraphNode>,
    edges: HashMap<StreamId, StreamEdge>,
}

impl FlowGraph {
    pub fn from_spec(spec: &FlowSpec) -> Self {
        let mut nodes = Vec::with_capacity(spec.processors.len());
        let mut edges: HashMap<StreamId, StreamEdge> = HashMap::new();

        for (idx, proc) in spec.processors.iter().enumerate() {
            for (port, output) in proc.output.iter().enumerate() {
                for stream in output.streams.iter().filter(|s| s.stream_type == StreamType::Local) {
                    let edge = edges.entry(stream.stream_id).or_default();
                    edge.stream_id = stream.stream_id;
                    edge.producers.push(Endpoint { processor: idx, port });
                }
            }
            for (port, input) in proc.input.iter().enumerate() {
                for stream in input.streams.iter().filter(|s| s.stream_type == StreamType::Local) {
                    let edge = edges.entry(stream.stream_id).or_default();
                    edge.stream_id = stream.stream_id;
                    edge.consumers.push(Endpoint { processor: idx, port });
                }
            }

            let fusable_output = match proc.output.as_slice() {
                [out] if out.router_type == RouterType::PassThrough => match out.streams.as_slice() {
                    [s] if s.stream_type == StreamType::Local => Some(s.stream_id),
                    _ => None,
                },
                _ => None,
            };
            let inputs = proc
                .input
                .iter()
                .map(|i| {
                    let streams = i.streams.iter().map(|s| s.stream_id).collect();
                    (streams, i.sync_type == SyncType::Unordered)
                })
                .collect();
            nodes.push(GraphNode {
                processor_id: proc.processor_id,
                fusable_output,
                inputs,
            });
        }

        FlowGraph { nodes, edges }
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edge(&self, stream_id: StreamId) -> Option<&StreamEdge> {
        self.edges.get(&stream_id)
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Decide which processors run inside their consumer's task
    pub fn plan_fusion(&self) -> FusionPlan {
        let mut plan = FusionPlan::default();
        for (idx, node) in self.nodes.iter().enumerate() {
            let Some(stream_id) = node.fusable_output else {
                continue;
            };
            if let Some(target) = self.fusion_target(idx, stream_id) {
                plan.fused.insert(idx, target);
            }
        }
        plan
    }

    /// The first later single-stream input consuming `stream_id`; only an
    /// unordered one can take the producer directly.
    fn fusion_target(&self, producer: usize, stream_id: StreamId) -> Option<(usize, usize)> {
        for (idx, node) in self.nodes.iter().enumerate().skip(producer + 1) {
            for (port, (streams, unordered)) in node.inputs.iter().enumerate() {
                if streams.as_slice() != [stream_id] {
                    continue;
                }
                return unordered.then_some((idx, port));
            }
        }
        None
    }
}
