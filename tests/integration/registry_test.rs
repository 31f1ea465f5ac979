use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use bayunflow::common::memory::MemoryMonitor;
use bayunflow::exec::receiver::Message;
use bayunflow::exec::row::{DataValue, Row};
use bayunflow::flow::spec::{InputSyncSpec, OutputRouterSpec, ProcessorCoreSpec, ProcessorSpec, StreamEndpointSpec};
use bayunflow::flow::Flow;
use bayunflow::{Context, FlowCtx, FlowError, FlowId, FlowRegistry, FlowSpec, RowBuffer, Settings, TableCatalog};

#[path = "../common/mod.rs"]
mod common;
use common::{first_column, wait_done};

/// A flow on node 1 whose only processor consumes remote streams
fn remote_consumer(
    settings: Settings,
    registry: &Arc<FlowRegistry>,
    streams: &[i32],
) -> Result<(Flow, Arc<RowBuffer>)> {
    let flow_id = FlowId::new_random();
    let flow_ctx = FlowCtx::new(
        flow_id,
        1,
        Arc::new(settings),
        MemoryMonitor::unlimited("test"),
        Arc::new(TableCatalog::new()),
    );
    let sink = Arc::new(RowBuffer::new());
    let mut flow = Flow::new(Arc::new(flow_ctx), Arc::clone(registry), Some(sink.clone()));
    let spec = FlowSpec::new(flow_id, 1).with_processor(
        ProcessorSpec::new(0, ProcessorCoreSpec::Noop)
            .with_input(InputSyncSpec::unordered(
                streams.iter().map(|id| StreamEndpointSpec::remote(*id, 2)).collect(),
            ))
            .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
    );
    flow.setup(&spec)?;
    Ok((flow, sink))
}

#[test]
fn test_unconnected_stream_times_out() -> Result<()> {
    let registry = FlowRegistry::new(1);
    let settings = Settings::new();
    // read at registration, so a change before start applies
    settings.set_flow_stream_timeout(Duration::from_millis(50));
    let (mut flow, sink) = remote_consumer(settings, &registry, &[1])?;
    let flow_id = flow.flow_id();

    let started = Instant::now();
    flow.start_sync(&Context::background())?;
    flow.wait();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(40), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "timed out late: {:?}", elapsed);

    assert_eq!(sink.first_error(), Some(FlowError::DeadlineExceeded { flow_id, stream_id: 1 }));
    assert!(sink.is_done());
    // every stream finished, so the entry is already gone
    assert!(!registry.is_registered(flow_id));
    assert!(matches!(registry.connect_inbound_stream(flow_id, 1), Err(FlowError::UnknownFlow(_))));
    flow.cleanup();
    Ok(())
}

#[test]
fn test_timed_out_stream_rejects_late_connection() -> Result<()> {
    let registry = FlowRegistry::new(1);
    let settings = Settings::new().with_flow_stream_timeout(Duration::from_millis(50));
    let (mut flow, sink) = remote_consumer(settings, &registry, &[1, 2])?;
    let flow_id = flow.flow_id();

    flow.start_async(&Context::background())?;
    let stream = registry.connect_inbound_stream(flow_id, 1)?;
    stream.receiver().push(Message::Row(Row::new(vec![DataValue::Integer(7)])));
    thread::sleep(Duration::from_millis(200));

    assert!(matches!(
        registry.connect_inbound_stream(flow_id, 2),
        Err(FlowError::StreamCanceled { stream_id: 2, .. })
    ));
    assert!(registry.is_registered(flow_id));
    stream.finish();

    flow.wait();
    flow.cleanup();
    assert!(!registry.is_registered(flow_id));
    assert_eq!(first_column(&sink.rows()), vec![7]);
    assert_eq!(sink.first_error(), Some(FlowError::DeadlineExceeded { flow_id, stream_id: 2 }));
    Ok(())
}

#[test]
fn test_cancel_unblocks_pending_streams() -> Result<()> {
    let registry = FlowRegistry::new(1);
    let settings = Settings::new().with_flow_stream_timeout(Duration::from_secs(30));
    let (mut flow, sink) = remote_consumer(settings, &registry, &[1])?;
    let flow_id = flow.flow_id();

    let (ctx, cancel) = Context::background().with_cancel();
    flow.start_async(&ctx)?;
    assert!(registry.is_registered(flow_id));

    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
    });
    // Returns only because cancellation unblocked the stream nobody connected.
    flow.wait();
    canceler.join().unwrap();

    wait_done(&sink)?;
    assert_eq!(sink.first_error(), Some(FlowError::QueryCanceled));
    // the stream's error is the only one; the processor does not add its own
    assert_eq!(sink.metadata().iter().filter(|m| m.err.is_some()).count(), 1);
    assert!(matches!(
        registry.connect_inbound_stream(flow_id, 1),
        Err(FlowError::StreamCanceled { .. })
    ));
    flow.cleanup();
    assert!(!registry.is_registered(flow_id));
    Ok(())
}

#[test]
fn test_connected_stream_delivers_rows() -> Result<()> {
    let registry = FlowRegistry::new(1);
    let (mut flow, sink) = remote_consumer(Settings::new(), &registry, &[4])?;
    let flow_id = flow.flow_id();

    flow.start_async(&Context::background())?;
    let producer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || -> Result<()> {
            let stream = registry.connect_inbound_stream_wait(flow_id, 4, Duration::from_secs(5))?;
            for i in 0..25 {
                stream.receiver().push(Message::Row(Row::new(vec![DataValue::Integer(i)])));
            }
            // dropping the stream finishes it
            Ok(())
        })
    };
    producer.join().unwrap()?;

    flow.wait();
    flow.cleanup();
    assert_eq!(first_column(&sink.rows()), (0..25).collect::<Vec<_>>());
    assert_eq!(sink.first_error(), None);
    Ok(())
}
