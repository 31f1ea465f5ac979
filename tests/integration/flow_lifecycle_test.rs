use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use bayunflow::exec::expr::{CmpOp, Expr};
use bayunflow::common::context::CancelHandle;
use bayunflow::exec::receiver::{ConsumerStatus, Message, RowReceiver};
use bayunflow::exec::row::ColumnOrdering;
use bayunflow::flow::spec::{
    InputSyncSpec, OutputRouterSpec, PostProcessSpec, ProcessorCoreSpec, ProcessorSpec, StreamEndpointSpec,
};
use bayunflow::flow::{Flow, TestingKnobs};
use bayunflow::{Context, FlowCtx, FlowError, FlowId, FlowRegistry, FlowServer, FlowSpec, FlowStatus, RowBuffer, Settings};

#[path = "../common/mod.rs"]
mod common;
use common::{first_column, int_rows, int_table, scan, values, wait_done};

fn local_in(id: i32) -> InputSyncSpec {
    InputSyncSpec::unordered(vec![StreamEndpointSpec::local(id)])
}

fn new_flow(sink: &Arc<RowBuffer>, knobs: TestingKnobs) -> Flow {
    let flow_ctx = FlowCtx::local(FlowId::new_random()).with_testing_knobs(knobs);
    Flow::new(Arc::new(flow_ctx), FlowRegistry::new(0), Some(sink.clone()))
}

/// values -> filter (k >= 10) -> noop (offset 5, limit 50) -> client
fn pipeline(flow_id: FlowId) -> FlowSpec {
    FlowSpec::new(flow_id, 0)
        .with_processor(values(0, int_rows(200), StreamEndpointSpec::local(1)))
        .with_processor(
            ProcessorSpec::new(
                1,
                ProcessorCoreSpec::Filterer {
                    filter: Expr::cmp(CmpOp::GtEq, Expr::col(0), Expr::int(10)),
                },
            )
            .with_input(local_in(1))
            .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::local(2))),
        )
        .with_processor(
            ProcessorSpec::new(2, ProcessorCoreSpec::Noop)
                .with_input(local_in(2))
                .with_post(PostProcessSpec {
                    offset: 5,
                    limit: Some(50),
                    ..Default::default()
                })
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        )
}

fn run_pipeline(knobs: TestingKnobs) -> Result<(Vec<i64>, usize)> {
    let sink = Arc::new(RowBuffer::new());
    let mut flow = new_flow(&sink, knobs);
    let spec = pipeline(flow.flow_id());
    flow.setup(&spec)?;
    let fused = flow.num_fused();
    flow.start_sync(&Context::background())?;
    flow.wait();
    flow.cleanup();
    wait_done(&sink)?;
    assert_eq!(sink.first_error(), None);
    Ok((first_column(&sink.rows()), fused))
}

#[test]
fn test_fusion_does_not_change_results() -> Result<()> {
    let (fused_rows, fused) = run_pipeline(TestingKnobs::default())?;
    let (plain_rows, not_fused) = run_pipeline(TestingKnobs { disable_fusion: true })?;

    assert_eq!(fused, 2);
    assert_eq!(not_fused, 0);
    assert_eq!(fused_rows, (15..65).collect::<Vec<_>>());
    assert_eq!(fused_rows, plain_rows);
    Ok(())
}

#[test]
fn test_async_start_and_wait() -> Result<()> {
    let sink = Arc::new(RowBuffer::new());
    let mut flow = new_flow(&sink, TestingKnobs { disable_fusion: true });
    let spec = FlowSpec::new(flow.flow_id(), 0)
        .with_processor(values(0, int_rows(100), StreamEndpointSpec::local(1)))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Sorter { ordering: ColumnOrdering::desc(&[0]) })
                .with_input(local_in(1))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );

    flow.setup(&spec)?;
    assert_eq!(flow.status(), FlowStatus::NotStarted);
    flow.start_async(&Context::background())?;
    assert_eq!(flow.status(), FlowStatus::Running);
    flow.wait();
    flow.cleanup();
    assert_eq!(flow.status(), FlowStatus::Finished);

    assert!(sink.is_done());
    assert_eq!(first_column(&sink.rows()), (0..100).rev().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_empty_flow_is_a_noop() -> Result<()> {
    let sink = Arc::new(RowBuffer::new());
    let mut flow = new_flow(&sink, TestingKnobs::default());
    flow.setup(&FlowSpec::new(flow.flow_id(), 0))?;
    flow.start_sync(&Context::background())?;
    flow.wait();
    flow.cleanup();

    assert!(sink.is_done());
    assert!(sink.rows().is_empty());
    assert!(sink.metadata().is_empty());
    Ok(())
}

#[test]
#[should_panic(expected = "flow cleanup called twice")]
fn test_cleanup_twice_panics() {
    let sink = Arc::new(RowBuffer::new());
    let mut flow = new_flow(&sink, TestingKnobs::default());
    flow.cleanup();
    flow.cleanup();
}

#[test]
fn test_done_fn_called_once_on_cleanup() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(RowBuffer::new());
    let counter = calls.clone();
    let mut flow = new_flow(&sink, TestingKnobs::default()).with_done_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let spec = FlowSpec::new(flow.flow_id(), 0).with_processor(values(0, int_rows(3), StreamEndpointSpec::sync_response()));
    flow.setup(&spec)?;
    flow.start_sync(&Context::background())?;
    flow.wait();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    flow.cleanup();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_consumer_closed_stops_producers() -> Result<()> {
    let sink = Arc::new(RowBuffer::new());
    sink.set_status(ConsumerStatus::ConsumerClosed);
    let mut flow = new_flow(&sink, TestingKnobs { disable_fusion: true });
    let spec = FlowSpec::new(flow.flow_id(), 0)
        .with_processor(values(0, int_rows(10_000), StreamEndpointSpec::local(1)))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(local_in(1))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );

    flow.setup(&spec)?;
    flow.start_sync(&Context::background())?;
    // The values producer is blocked on a full channel unless closing
    // the channel released it.
    flow.wait();
    flow.cleanup();
    assert!(sink.is_done());
    assert_eq!(sink.rows().len(), 1);
    Ok(())
}

/// Collects rows and cancels the query once it has seen `cancel_at` of them
struct CancelingSink {
    rows: RowBuffer,
    cancel_at: usize,
    seen: AtomicUsize,
    cancel: CancelHandle,
}

impl RowReceiver for CancelingSink {
    fn push(&self, msg: Message) -> ConsumerStatus {
        if matches!(msg, Message::Row(_)) && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_at {
            self.cancel.cancel();
        }
        self.rows.push(msg)
    }

    fn producer_done(&self) {
        self.rows.producer_done();
    }
}

#[test]
fn test_canceled_pipeline_reports_one_error() -> Result<()> {
    let (ctx, cancel) = Context::background().with_cancel();
    let sink = Arc::new(CancelingSink {
        rows: RowBuffer::new(),
        cancel_at: 5,
        seen: AtomicUsize::new(0),
        cancel,
    });
    let flow_ctx = FlowCtx::local(FlowId::new_random()).with_testing_knobs(TestingKnobs { disable_fusion: true });
    let mut flow = Flow::new(Arc::new(flow_ctx), FlowRegistry::new(0), Some(sink.clone()));
    let spec = FlowSpec::new(flow.flow_id(), 0)
        .with_processor(values(0, int_rows(100_000), StreamEndpointSpec::local(1)))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(local_in(1))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::local(2))),
        )
        .with_processor(
            ProcessorSpec::new(2, ProcessorCoreSpec::Noop)
                .with_input(local_in(2))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );

    flow.setup(&spec)?;
    assert_eq!(flow.num_fused(), 0);
    flow.start_async(&ctx)?;
    flow.wait();
    flow.cleanup();

    wait_done(&sink.rows)?;
    let errors: Vec<FlowError> = sink.rows.metadata().into_iter().filter_map(|m| m.err).collect();
    assert_eq!(errors, vec![FlowError::QueryCanceled]);
    assert!(sink.rows.rows().len() < 100_000);
    Ok(())
}

#[test]
fn test_drain_request_from_consumer() -> Result<()> {
    let sink = Arc::new(RowBuffer::with_row_limit(10));
    let mut flow = new_flow(&sink, TestingKnobs { disable_fusion: true });
    let spec = FlowSpec::new(flow.flow_id(), 0)
        .with_processor(values(0, int_rows(10_000), StreamEndpointSpec::local(1)))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(local_in(1))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );

    flow.setup(&spec)?;
    flow.start_sync(&Context::background())?;
    flow.wait();
    flow.cleanup();
    assert!(sink.is_done());
    assert_eq!(sink.rows().len(), 10);
    Ok(())
}

#[test]
fn test_local_hash_router_fans_back_in() -> Result<()> {
    let sink = Arc::new(RowBuffer::new());
    let mut flow = new_flow(&sink, TestingKnobs::default());
    let spec = FlowSpec::new(flow.flow_id(), 0)
        .with_processor(
            ProcessorSpec::new(0, ProcessorCoreSpec::Values { rows: int_rows(500) }).with_output(
                OutputRouterSpec::by_hash(vec![0], vec![StreamEndpointSpec::local(1), StreamEndpointSpec::local(2)]),
            ),
        )
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(InputSyncSpec::unordered(vec![StreamEndpointSpec::local(1), StreamEndpointSpec::local(2)]))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );

    flow.setup(&spec)?;
    flow.start_sync(&Context::background())?;
    flow.wait();
    flow.cleanup();

    let mut rows = first_column(&sink.rows());
    rows.sort_unstable();
    assert_eq!(rows, (0..500).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_mirror_router_duplicates_rows() -> Result<()> {
    let sink = Arc::new(RowBuffer::new());
    let mut flow = new_flow(&sink, TestingKnobs::default());
    let spec = FlowSpec::new(flow.flow_id(), 0)
        .with_processor(
            ProcessorSpec::new(0, ProcessorCoreSpec::Values { rows: int_rows(20) }).with_output(
                OutputRouterSpec::mirror(vec![StreamEndpointSpec::local(1), StreamEndpointSpec::local(2)]),
            ),
        )
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(InputSyncSpec::ordered(
                    ColumnOrdering::asc(&[0]),
                    vec![StreamEndpointSpec::local(1), StreamEndpointSpec::local(2)],
                ))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );

    flow.setup(&spec)?;
    flow.start_sync(&Context::background())?;
    flow.wait();
    flow.cleanup();

    let expected: Vec<i64> = (0..20).flat_map(|i| [i, i]).collect();
    assert_eq!(first_column(&sink.rows()), expected);
    Ok(())
}

#[test]
fn test_processor_error_reaches_consumer() -> Result<()> {
    let server = FlowServer::new(1, Arc::new(Settings::new()));
    server.tables().create_table(int_table("present", 10));
    let spec = FlowSpec::new(FlowId::new_random(), 1)
        .with_processor(scan(0, "missing", OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())));
    let sink = Arc::new(RowBuffer::new());

    server.run_sync_flow(&Context::background(), &spec, sink.clone())?;
    wait_done(&sink)?;
    assert_eq!(sink.first_error(), Some(FlowError::TableNotFound("missing".to_string())));
    Ok(())
}

#[test]
fn test_sort_over_memory_budget_fails() -> Result<()> {
    let server = FlowServer::new(1, Arc::new(Settings::new())).with_memory_budget(256);
    let spec = FlowSpec::new(FlowId::new_random(), 1)
        .with_processor(values(0, int_rows(1000), StreamEndpointSpec::local(1)))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Sorter { ordering: ColumnOrdering::asc(&[0]) })
                .with_input(local_in(1))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );
    let sink = Arc::new(RowBuffer::new());

    server.run_sync_flow(&Context::background(), &spec, sink.clone())?;
    wait_done(&sink)?;
    assert!(matches!(sink.first_error(), Some(FlowError::MemoryBudgetExceeded { .. })));
    assert_eq!(server.monitor().used(), 0);
    Ok(())
}

#[test]
fn test_table_scan_with_range() -> Result<()> {
    let server = FlowServer::new(1, Arc::new(Settings::new()));
    server.tables().create_table(int_table("t", 100));
    let spec = FlowSpec::new(FlowId::new_random(), 1).with_processor(
        ProcessorSpec::new(
            0,
            ProcessorCoreSpec::TableReader {
                table: "t".to_string(),
                start: Some(10),
                end: Some(20),
            },
        )
        .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
    );
    let sink = Arc::new(RowBuffer::new());

    server.run_sync_flow(&Context::background(), &spec, sink.clone())?;
    assert_eq!(first_column(&sink.rows()), (10..20).collect::<Vec<_>>());
    Ok(())
}
