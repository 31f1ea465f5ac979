use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use bayunflow::common::types::NodeId;
use bayunflow::exec::row::ColumnOrdering;
use bayunflow::flow::spec::{
    InputSyncSpec, OutputRouterSpec, PostProcessSpec, ProcessorCoreSpec, ProcessorSpec, StreamEndpointSpec,
};
use bayunflow::net::transport::Dialer;
use bayunflow::{Context, FlowError, FlowId, FlowSpec, RowBuffer, Settings};
use rand::seq::SliceRandom;

#[path = "../common/mod.rs"]
mod common;
use common::{TestCluster, first_column, int_table, scan, wait_done};

const GATEWAY: NodeId = 1;
const WORKERS: [NodeId; 2] = [2, 3];

/// Gateway -> worker streams are 1 and 2, worker -> gateway 3 and 4
fn worker_spec(flow_id: FlowId, idx: usize, core: ProcessorCoreSpec) -> FlowSpec {
    let inbound = idx as i32 + 1;
    let outbound = idx as i32 + 3;
    FlowSpec::new(flow_id, GATEWAY).with_processor(
        ProcessorSpec::new(0, core)
            .with_input(InputSyncSpec::unordered(vec![StreamEndpointSpec::remote(inbound, GATEWAY)]))
            .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::remote(outbound, GATEWAY))),
    )
}

fn gateway_spec(flow_id: FlowId, table: &str, ordered: bool, post: PostProcessSpec) -> FlowSpec {
    let outputs = WORKERS
        .iter()
        .enumerate()
        .map(|(idx, node)| StreamEndpointSpec::remote(idx as i32 + 1, *node))
        .collect();
    let inputs: Vec<_> = WORKERS
        .iter()
        .enumerate()
        .map(|(idx, node)| StreamEndpointSpec::remote(idx as i32 + 3, *node))
        .collect();
    let input = if ordered {
        InputSyncSpec::ordered(ColumnOrdering::asc(&[0]), inputs)
    } else {
        InputSyncSpec::unordered(inputs)
    };
    FlowSpec::new(flow_id, GATEWAY)
        .with_processor(scan(0, table, OutputRouterSpec::by_hash(vec![0], outputs)))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(input)
                .with_post(post)
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        )
}

fn setup_workers(cluster: &TestCluster, flow_id: FlowId, core: &ProcessorCoreSpec) -> Result<()> {
    for (idx, node) in WORKERS.iter().enumerate() {
        cluster.network.setup_remote_flow(*node, worker_spec(flow_id, idx, core.clone()))?;
    }
    Ok(())
}

fn shuffled_table(cluster: &TestCluster, n: i64) {
    let mut table = int_table("t", n).rows().to_vec();
    table.shuffle(&mut rand::thread_rng());
    cluster
        .node(GATEWAY)
        .tables()
        .create_table(bayunflow::Table::new("t", vec!["k".to_string()], table));
}

#[test]
fn test_hash_partitioned_round_trip() -> Result<()> {
    let cluster = TestCluster::new(3, Settings::new());
    cluster.node(GATEWAY).tables().create_table(int_table("t", 1000));
    let flow_id = FlowId::new_random();

    setup_workers(&cluster, flow_id, &ProcessorCoreSpec::Noop)?;
    let sink = Arc::new(RowBuffer::new());
    cluster
        .node(GATEWAY)
        .run_sync_flow(&Context::background(), &gateway_spec(flow_id, "t", false, PostProcessSpec::default()), sink.clone())?;
    cluster.wait_remote_flows();

    assert_eq!(sink.first_error(), None);
    let mut keys = first_column(&sink.rows());
    keys.sort_unstable();
    assert_eq!(keys, (0..1000).collect::<Vec<_>>());

    // each key went to exactly one worker, and both got some
    let per_worker: Vec<u64> = WORKERS.iter().map(|n| cluster.node(*n).rows_received()).collect();
    assert_eq!(per_worker.iter().sum::<u64>(), 1000);
    assert!(per_worker.iter().all(|n| *n > 0));
    assert_eq!(cluster.node(GATEWAY).rows_received(), 1000);
    for server in &cluster.servers {
        assert_eq!(server.registry().num_flows(), 0);
    }
    Ok(())
}

#[test]
fn test_gateway_starts_before_workers() -> Result<()> {
    let cluster = TestCluster::new(3, Settings::new());
    cluster.node(GATEWAY).tables().create_table(int_table("t", 300));
    let flow_id = FlowId::new_random();
    let sink = Arc::new(RowBuffer::new());

    let gateway = {
        let server = Arc::clone(cluster.node(GATEWAY));
        let sink = sink.clone();
        thread::spawn(move || {
            server.run_sync_flow(&Context::background(), &gateway_spec(flow_id, "t", false, PostProcessSpec::default()), sink)
        })
    };
    // outboxes dial workers whose flows are not registered yet
    thread::sleep(Duration::from_millis(50));
    setup_workers(&cluster, flow_id, &ProcessorCoreSpec::Noop)?;

    gateway.join().map_err(|_| anyhow!("gateway panicked"))??;
    cluster.wait_remote_flows();
    assert_eq!(sink.first_error(), None);
    assert_eq!(sink.rows().len(), 300);
    Ok(())
}

/// Run the hash round trip with workers joining one at a time, in `order`
fn run_with_staggered_workers(order: [NodeId; 2]) -> Result<()> {
    let cluster = TestCluster::new(3, Settings::new());
    cluster.node(GATEWAY).tables().create_table(int_table("t", 500));
    let flow_id = FlowId::new_random();
    let sink = Arc::new(RowBuffer::new());

    let gateway = {
        let server = Arc::clone(cluster.node(GATEWAY));
        let sink = sink.clone();
        thread::spawn(move || {
            server.run_sync_flow(&Context::background(), &gateway_spec(flow_id, "t", false, PostProcessSpec::default()), sink)
        })
    };
    for node in order {
        thread::sleep(Duration::from_millis(30));
        let idx = WORKERS.iter().position(|w| *w == node).ok_or_else(|| anyhow!("not a worker: {}", node))?;
        cluster
            .network
            .setup_remote_flow(node, worker_spec(flow_id, idx, ProcessorCoreSpec::Noop))?;
    }

    gateway.join().map_err(|_| anyhow!("gateway panicked"))??;
    cluster.wait_remote_flows();
    assert_eq!(sink.first_error(), None);
    let mut keys = first_column(&sink.rows());
    keys.sort_unstable();
    assert_eq!(keys, (0..500).collect::<Vec<_>>());
    for node in WORKERS {
        assert!(cluster.node(node).rows_received() > 0);
    }
    assert_eq!(WORKERS.iter().map(|n| cluster.node(*n).rows_received()).sum::<u64>(), 500);
    Ok(())
}

#[test]
fn test_first_worker_joins_before_second() -> Result<()> {
    run_with_staggered_workers([2, 3])
}

#[test]
fn test_second_worker_joins_before_first() -> Result<()> {
    run_with_staggered_workers([3, 2])
}

#[test]
fn test_distributed_sort_merges_in_order() -> Result<()> {
    let cluster = TestCluster::new(3, Settings::new().with_outbox_buffer_rows(7));
    shuffled_table(&cluster, 2000);
    let flow_id = FlowId::new_random();

    setup_workers(
        &cluster,
        flow_id,
        &ProcessorCoreSpec::Sorter {
            ordering: ColumnOrdering::asc(&[0]),
        },
    )?;
    let sink = Arc::new(RowBuffer::new());
    cluster
        .node(GATEWAY)
        .run_sync_flow(&Context::background(), &gateway_spec(flow_id, "t", true, PostProcessSpec::default()), sink.clone())?;
    cluster.wait_remote_flows();

    assert_eq!(sink.first_error(), None);
    assert_eq!(first_column(&sink.rows()), (0..2000).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_gateway_limit_drains_workers() -> Result<()> {
    let cluster = TestCluster::new(3, Settings::new());
    cluster.node(GATEWAY).tables().create_table(int_table("t", 50_000));
    let flow_id = FlowId::new_random();

    setup_workers(&cluster, flow_id, &ProcessorCoreSpec::Noop)?;
    let sink = Arc::new(RowBuffer::new());
    let post = PostProcessSpec {
        limit: Some(10),
        ..Default::default()
    };
    cluster
        .node(GATEWAY)
        .run_sync_flow(&Context::background(), &gateway_spec(flow_id, "t", false, post), sink.clone())?;
    // returns only if every worker flow finished
    cluster.wait_remote_flows();

    assert_eq!(sink.first_error(), None);
    let keys: HashSet<i64> = first_column(&sink.rows()).into_iter().collect();
    assert_eq!(keys.len(), 10);
    Ok(())
}

#[test]
fn test_unreachable_node_cancels_flow() -> Result<()> {
    let cluster = TestCluster::new(1, Settings::new());
    cluster.node(GATEWAY).tables().create_table(int_table("t", 100));
    let flow_id = FlowId::new_random();
    let spec = FlowSpec::new(flow_id, GATEWAY)
        .with_processor(scan(
            0,
            "t",
            OutputRouterSpec::pass_through(StreamEndpointSpec::remote(1, 9)),
        ))
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(InputSyncSpec::unordered(vec![StreamEndpointSpec::remote(2, 9)]))
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        );
    let sink = Arc::new(RowBuffer::new());

    cluster.node(GATEWAY).run_sync_flow(&Context::background(), &spec, sink.clone())?;
    wait_done(&sink)?;
    assert!(sink.first_error().is_some_and(|err| err.is_canceled()));
    assert_eq!(cluster.node(GATEWAY).registry().num_flows(), 0);
    Ok(())
}

#[test]
fn test_remote_setup_error_is_returned() {
    let cluster = TestCluster::new(2, Settings::new());
    let spec = FlowSpec::new(FlowId::new_random(), GATEWAY).with_processor(
        ProcessorSpec::new(0, ProcessorCoreSpec::Noop)
            .with_input(InputSyncSpec::unordered(vec![StreamEndpointSpec::local(5)]))
            .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::remote(6, GATEWAY))),
    );
    let result = cluster.network.setup_remote_flow(2, spec);
    assert_eq!(result, Err(FlowError::NoProducer(5)));
}
