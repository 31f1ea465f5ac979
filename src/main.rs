use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;

use bayunflow::catalog::Table;
use bayunflow::common::types::{NodeId, StreamId};
use bayunflow::exec::row::{ColumnOrdering, DataValue, Row};
use bayunflow::flow::spec::{
    InputSyncSpec, OutputRouterSpec, PostProcessSpec, ProcessorCoreSpec, ProcessorSpec, StreamEndpointSpec,
};
use bayunflow::net::transport::Dialer;
use bayunflow::{Context, FlowId, FlowServer, FlowSpec, LocalNetwork, RowBuffer, Settings};

const GATEWAY: NodeId = 1;
const WORKERS: [NodeId; 2] = [2, 3];
const TABLE: &str = "kv";

#[derive(Parser)]
#[command(author, version, about = "Runs a query split across three in-process nodes")]
struct Cli {
    /// Number of rows in the scanned table
    #[arg(short, long, default_value_t = 10_000)]
    rows: i64,

    /// Sort on the workers and merge in order on the gateway
    #[arg(short, long)]
    sort: bool,

    /// Stop after this many result rows
    #[arg(short, long)]
    limit: Option<u64>,

    /// Rows buffered per outbox batch
    #[arg(long, default_value_t = 16)]
    batch_rows: usize,
}

fn table_rows(n: i64) -> Vec<Row> {
    (0..n)
        .map(|i| {
            let key = (i * 7919) % n.max(1);
            Row::new(vec![DataValue::Integer(key), DataValue::Text(format!("value-{}", i))])
        })
        .collect()
}

/// Streams gateway -> worker use ids 1..; worker -> gateway use 101..
fn to_worker(idx: usize) -> StreamId {
    idx as StreamId + 1
}

fn from_worker(idx: usize) -> StreamId {
    idx as StreamId + 101
}

fn worker_spec(flow_id: FlowId, idx: usize, sort: bool) -> FlowSpec {
    let core = if sort {
        ProcessorCoreSpec::Sorter { ordering: ColumnOrdering::asc(&[0]) }
    } else {
        ProcessorCoreSpec::Noop
    };
    FlowSpec::new(flow_id, GATEWAY).with_processor(
        ProcessorSpec::new(0, core)
            .with_input(InputSyncSpec::unordered(vec![StreamEndpointSpec::remote(to_worker(idx), GATEWAY)]))
            .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::remote(from_worker(idx), GATEWAY))),
    )
}

fn gateway_spec(flow_id: FlowId, sort: bool, limit: Option<u64>) -> FlowSpec {
    let outbound = WORKERS
        .iter()
        .enumerate()
        .map(|(idx, node)| StreamEndpointSpec::remote(to_worker(idx), *node))
        .collect();
    let inbound: Vec<_> = WORKERS
        .iter()
        .enumerate()
        .map(|(idx, node)| StreamEndpointSpec::remote(from_worker(idx), *node))
        .collect();
    let merge = if sort {
        InputSyncSpec::ordered(ColumnOrdering::asc(&[0]), inbound)
    } else {
        InputSyncSpec::unordered(inbound)
    };

    FlowSpec::new(flow_id, GATEWAY)
        .with_processor(
            ProcessorSpec::new(0, ProcessorCoreSpec::TableReader { table: TABLE.to_string(), start: None, end: None })
                .with_output(OutputRouterSpec::by_hash(vec![0], outbound)),
        )
        .with_processor(
            ProcessorSpec::new(1, ProcessorCoreSpec::Noop)
                .with_input(merge)
                .with_post(PostProcessSpec { limit, ..Default::default() })
                .with_output(OutputRouterSpec::pass_through(StreamEndpointSpec::sync_response())),
        )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let network = LocalNetwork::new();
    let settings = Arc::new(Settings::new().with_outbox_buffer_rows(cli.batch_rows));
    let gateway = Arc::new(FlowServer::new(GATEWAY, settings.clone()).with_dialer(network.clone()));
    gateway.register_with(&network);
    let workers: Vec<Arc<FlowServer>> = WORKERS
        .iter()
        .map(|node| Arc::new(FlowServer::new(*node, settings.clone()).with_dialer(network.clone())))
        .collect();
    for worker in &workers {
        worker.register_with(&network);
    }

    gateway
        .tables()
        .create_table(Table::new(TABLE, vec!["k".to_string(), "v".to_string()], table_rows(cli.rows)));

    let flow_id = FlowId::new_random();
    for (idx, node) in WORKERS.iter().enumerate() {
        network.setup_remote_flow(*node, worker_spec(flow_id, idx, cli.sort))?;
    }

    let sink = Arc::new(RowBuffer::new());
    gateway.run_sync_flow(&Context::background(), &gateway_spec(flow_id, cli.sort, cli.limit), sink.clone())?;
    for worker in &workers {
        worker.wait_remote_flows();
    }

    if let Some(err) = sink.first_error() {
        bail!("query failed: {}", err);
    }
    let rows = sink.rows();

    println!("flow {}", flow_id);
    for worker in &workers {
        println!("  node {}: {} rows received", worker.node_id(), worker.rows_received());
    }
    println!("  node {}: {} rows received", gateway.node_id(), gateway.rows_received());
    println!("total: {} rows", rows.len());

    if cli.sort {
        let ordering = ColumnOrdering::asc(&[0]);
        let sorted = rows.windows(2).all(|w| ordering.compare(&w[0], &w[1]).is_le());
        println!("ordered: {}", if sorted { "yes" } else { "no" });
    }
    Ok(())
}
