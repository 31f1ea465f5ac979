use std::sync::Arc;

use anyhow::Result;
use bayunflow::exec::row::ColumnOrdering;
use bayunflow::flow::spec::{
    InputSyncSpec, OutputRouterSpec, ProcessorCoreSpec, ProcessorSpec, StreamEndpointSpec, StreamType,
};
use bayunflow::{Context, FlowCtx, FlowError, FlowId, FlowRegistry, FlowServer, FlowSpec, RowBuffer, Settings};
use bayunflow::flow::Flow;

#[path = "../common/mod.rs"]
mod common;
use common::{int_rows, values, wait_done};

fn noop(id: i32, input: InputSyncSpec, out: StreamEndpointSpec) -> ProcessorSpec {
    ProcessorSpec::new(id, ProcessorCoreSpec::Noop)
        .with_input(input)
        .with_output(OutputRouterSpec::pass_through(out))
}

fn local_in(ids: &[i32]) -> InputSyncSpec {
    InputSyncSpec::unordered(ids.iter().map(|id| StreamEndpointSpec::local(*id)).collect())
}

/// Set up `spec` on a fresh flow with a terminal consumer
fn setup(build: impl FnOnce(FlowSpec) -> FlowSpec) -> std::result::Result<Flow, FlowError> {
    let flow_id = FlowId::new_random();
    let sink = Arc::new(RowBuffer::new());
    let mut flow = Flow::new(Arc::new(FlowCtx::local(flow_id)), FlowRegistry::new(0), Some(sink));
    flow.setup(&build(FlowSpec::new(flow_id, 0)))?;
    Ok(flow)
}

fn setup_err(build: impl FnOnce(FlowSpec) -> FlowSpec) -> FlowError {
    match setup(build) {
        Ok(_) => panic!("setup unexpectedly succeeded"),
        Err(err) => err,
    }
}

#[test]
fn test_input_without_streams() {
    let err = setup_err(|s| s.with_processor(noop(0, InputSyncSpec::unordered(vec![]), StreamEndpointSpec::sync_response())));
    assert_eq!(err, FlowError::InputSyncWithoutStreams);
}

#[test]
fn test_sync_response_as_input() {
    let err = setup_err(|s| {
        s.with_processor(noop(
            0,
            InputSyncSpec::unordered(vec![StreamEndpointSpec::sync_response()]),
            StreamEndpointSpec::sync_response(),
        ))
    });
    assert_eq!(err, FlowError::SyncResponseInbound(0));
}

#[test]
fn test_duplicate_inbound_consumer() {
    let err = setup_err(|s| {
        s.with_processor(noop(
            0,
            InputSyncSpec::unordered(vec![StreamEndpointSpec::remote(5, 2), StreamEndpointSpec::remote(5, 2)]),
            StreamEndpointSpec::sync_response(),
        ))
    });
    assert_eq!(err, FlowError::MultipleInboundConsumers(5));
}

#[test]
fn test_duplicate_local_consumer() {
    let err = setup_err(|s| {
        s.with_processor(values(0, int_rows(1), StreamEndpointSpec::local(3)))
            .with_processor(noop(1, local_in(&[3]), StreamEndpointSpec::sync_response()))
            .with_processor(noop(2, local_in(&[3]), StreamEndpointSpec::sync_response()))
    });
    assert_eq!(err, FlowError::MultipleLocalConsumers(3));
}

#[test]
fn test_two_producers_on_one_local_stream() {
    let err = setup_err(|s| {
        s.with_processor(values(0, int_rows(1), StreamEndpointSpec::local(3)))
            .with_processor(values(1, int_rows(1), StreamEndpointSpec::local(3)))
            .with_processor(noop(2, local_in(&[3]), StreamEndpointSpec::sync_response()))
    });
    assert_eq!(err, FlowError::MultipleConnections(3));
}

#[test]
fn test_producer_without_consumer() {
    let err = setup_err(|s| s.with_processor(values(0, int_rows(1), StreamEndpointSpec::local(7))));
    assert_eq!(err, FlowError::UnconnectedStream(7));
}

#[test]
fn test_consumer_without_producer() {
    let err = setup_err(|s| s.with_processor(noop(0, local_in(&[8]), StreamEndpointSpec::sync_response())));
    assert_eq!(err, FlowError::NoProducer(8));
}

#[test]
fn test_output_arity() {
    let err = setup_err(|s| s.with_processor(ProcessorSpec::new(4, ProcessorCoreSpec::Values { rows: int_rows(1) })));
    assert_eq!(err, FlowError::OutputArity { processor: 4, outputs: 0 });
}

#[test]
fn test_pass_through_arity() {
    let err = setup_err(|s| {
        s.with_processor(ProcessorSpec::new(0, ProcessorCoreSpec::Values { rows: int_rows(1) }).with_output(
            OutputRouterSpec {
                router_type: bayunflow::flow::spec::RouterType::PassThrough,
                streams: vec![StreamEndpointSpec::sync_response(), StreamEndpointSpec::local(1)],
            },
        ))
    });
    assert_eq!(err, FlowError::PassThroughArity(2));
}

#[test]
fn test_remote_output_without_target() {
    let endpoint = StreamEndpointSpec {
        stream_type: StreamType::Remote,
        stream_id: 9,
        target_node: None,
    };
    let err = setup_err(|s| s.with_processor(values(0, int_rows(1), endpoint)));
    assert_eq!(err, FlowError::MissingTargetNode(9));
}

#[test]
fn test_input_arity() {
    let err = setup_err(|s| {
        s.with_processor(
            ProcessorSpec::new(0, ProcessorCoreSpec::Noop)
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        )
    });
    assert_eq!(err, FlowError::InputArity { expected: 1, actual: 0 });
}

#[test]
fn test_ordered_input_setup() -> Result<()> {
    let flow = setup(|s| {
        s.with_processor(values(0, int_rows(3), StreamEndpointSpec::local(1)))
            .with_processor(values(1, int_rows(3), StreamEndpointSpec::local(2)))
            .with_processor(noop(
                2,
                InputSyncSpec::ordered(
                    ColumnOrdering::asc(&[0]),
                    vec![StreamEndpointSpec::local(1), StreamEndpointSpec::local(2)],
                ),
                StreamEndpointSpec::sync_response(),
            ))
    })?;
    // Ordered inputs never take a fused producer.
    assert_eq!(flow.num_processors(), 3);
    assert_eq!(flow.num_fused(), 0);
    Ok(())
}

#[test]
fn test_remote_inputs_are_recorded() -> Result<()> {
    let flow = setup(|s| {
        s.with_processor(noop(
            0,
            InputSyncSpec::unordered(vec![StreamEndpointSpec::remote(1, 2), StreamEndpointSpec::remote(2, 3)]),
            StreamEndpointSpec::sync_response(),
        ))
    })?;
    assert_eq!(flow.num_inbound_streams(), 2);
    Ok(())
}

#[test]
fn test_setup_error_reaches_consumer() -> Result<()> {
    let server = FlowServer::new(1, Arc::new(Settings::new()));
    let flow_id = FlowId::new_random();
    let spec = FlowSpec::new(flow_id, 1).with_processor(noop(0, local_in(&[8]), StreamEndpointSpec::sync_response()));
    let sink = Arc::new(RowBuffer::new());

    server.run_sync_flow(&Context::background(), &spec, sink.clone())?;
    wait_done(&sink)?;
    assert_eq!(sink.first_error(), Some(FlowError::NoProducer(8)));
    assert!(sink.rows().is_empty());
    Ok(())
}

#[test]
fn test_remote_output_without_dialer() {
    let err = setup_err(|s| s.with_processor(values(0, int_rows(1), StreamEndpointSpec::remote(3, 2))));
    assert!(matches!(err, FlowError::Transport { node: 2, .. }));
}
