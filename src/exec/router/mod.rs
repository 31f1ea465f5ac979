// Routers
//
// Fan-out from one producer to several streams. A mirror router sends every
// row to every stream; a hash router picks one stream per row by hashing
// some of its columns; a range router looks the row's key up in a sorted
// list of spans. Pass-through outputs never get a router object.
//
// Every output owns a buffer and a task (see `output`), so producer_done
// reaches each stream independently of how slow the others are.

mod output;

use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;

use crossbeam::sync::WaitGroup;
use log::{debug, error};
use xxhash_rust::xxh3::xxh3_64;

use crate::common::context::{CancelHandle, Context};
use crate::common::memory::MemoryMonitor;
use crate::common::types::FlowId;
use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::{ConsumerStatus, Message, RowReceiver};
use crate::exec::row::{compare_keys, DataValue, Row};
use crate::flow::spec::{RangeSpan, RouterType};
use crate::flow::Startable;

use output::RouterOutput;

enum RoutingKind {
    Mirror,
    ByHash { columns: Vec<usize> },
    ByRange {
        columns: Vec<usize>,
        spans: Vec<RangeSpan>,
        default_stream: Option<usize>,
    },
}

/// A fan-out router over a fixed set of streams
pub struct Router {
    flow_id: FlowId,
    kind: RoutingKind,
    outputs: Vec<Arc<RouterOutput>>,
}

impl Router {
    pub fn new(
        flow_id: FlowId,
        router_type: &RouterType,
        streams: Vec<Arc<dyn RowReceiver>>,
        monitor: &Arc<MemoryMonitor>,
    ) -> Result<Self> {
        let n = streams.len();
        if n == 0 {
            return Err(FlowError::InvalidSpec("router with no streams".to_string()));
        }
        let kind = match router_type {
            RouterType::PassThrough => {
                return Err(FlowError::InvalidSpec(
                    "pass-through outputs are not routed".to_string(),
                ));
            }
            RouterType::Mirror => RoutingKind::Mirror,
            RouterType::ByHash { hash_columns } => {
                if hash_columns.is_empty() {
                    return Err(FlowError::InvalidSpec("hash router with no columns".to_string()));
                }
                RoutingKind::ByHash {
                    columns: hash_columns.clone(),
                }
            }
            RouterType::ByRange {
                columns,
                spans,
                default_stream,
            } => {
                let out_of_range = spans.iter().map(|s| s.stream).chain(*default_stream).find(|&s| s >= n);
                if let Some(stream) = out_of_range {
                    return Err(FlowError::InvalidSpec(format!(
                        "range router targets stream {} but has {}",
                        stream, n
                    )));
                }
                if let Some(span) = spans.iter().find(|s| compare_keys(&s.start, &s.end) != Ordering::Less) {
                    return Err(FlowError::InvalidSpec(format!(
                        "range router span to stream {} is empty",
                        span.stream
                    )));
                }
                let sorted = spans
                    .windows(2)
                    .all(|w| compare_keys(&w[0].end, &w[1].start) != Ordering::Greater);
                if !sorted {
                    return Err(FlowError::InvalidSpec("range router spans overlap or are unsorted".to_string()));
                }
                RoutingKind::ByRange {
                    columns: columns.clone(),
                    spans: spans.clone(),
                    default_stream: *default_stream,
                }
            }
        };

        let account = monitor.make_account();
        let outputs = streams
            .into_iter()
            .map(|stream| Arc::new(RouterOutput::new(stream, Arc::clone(&account))))
            .collect();
        Ok(Router { flow_id, kind, outputs })
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Output indices a row goes to
    fn destinations(&self, row: &Row) -> Result<Vec<usize>> {
        match &self.kind {
            RoutingKind::Mirror => Ok((0..self.outputs.len()).collect()),
            RoutingKind::ByHash { columns } => {
                let key = key_values(row, columns)?;
                let idx = hash_key(&key)? % self.outputs.len() as u64;
                Ok(vec![idx as usize])
            }
            RoutingKind::ByRange {
                columns,
                spans,
                default_stream,
            } => {
                let key: Vec<DataValue> = key_values(row, columns)?.into_iter().cloned().collect();
                // first span that does not end at or before the key
                let idx = spans.partition_point(|s| compare_keys(&s.end, &key) != Ordering::Greater);
                match spans.get(idx) {
                    Some(span) if compare_keys(&span.start, &key) != Ordering::Greater => Ok(vec![span.stream]),
                    _ => match default_stream {
                        Some(stream) => Ok(vec![*stream]),
                        None => Err(FlowError::Execution(format!("no range router span for key {}", Row::new(key)))),
                    },
                }
            }
        }
    }

    /// Most permissive status across all outputs
    fn aggregate_status(&self) -> ConsumerStatus {
        self.outputs
            .iter()
            .map(|o| o.status())
            .min()
            .unwrap_or(ConsumerStatus::ConsumerClosed)
    }

    fn forward_metadata(&self, msg: Message) {
        let open = self
            .outputs
            .iter()
            .find(|o| o.status() != ConsumerStatus::ConsumerClosed);
        if let Some(output) = open {
            if let Err(err) = output.add(msg) {
                error!("flow {}: router failed to forward metadata: {}", self.flow_id.short(), err);
            }
        }
    }
}

fn key_values<'a>(row: &'a Row, columns: &[usize]) -> Result<Vec<&'a DataValue>> {
    columns
        .iter()
        .map(|&idx| {
            row.get(idx).ok_or(FlowError::ColumnOutOfRange {
                index: idx,
                width: row.len(),
            })
        })
        .collect()
}

/// Hash of a routing key. Integral floats hash as the equal integer, so keys
/// that compare equal land on the same stream.
fn hash_key(key: &[&DataValue]) -> Result<u64> {
    let normalized: Vec<DataValue> = key
        .iter()
        .map(|value| match value {
            DataValue::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                DataValue::Integer(*f as i64)
            }
            other => (*other).clone(),
        })
        .collect();
    Ok(xxh3_64(&bincode::serialize(&normalized)?))
}

impl RowReceiver for Router {
    fn push(&self, msg: Message) -> ConsumerStatus {
        let row = match msg {
            Message::Row(row) => row,
            meta => {
                self.forward_metadata(meta);
                return self.aggregate_status();
            }
        };
        let result = self.destinations(&row).and_then(|dests| {
            for idx in dests {
                self.outputs[idx].add(Message::Row(row.clone()))?;
            }
            Ok(())
        });
        if let Err(err) = result {
            self.forward_metadata(Message::error(err));
            return ConsumerStatus::DrainRequested.max(self.aggregate_status());
        }
        self.aggregate_status()
    }

    fn producer_done(&self) {
        for output in &self.outputs {
            output.producer_done();
        }
    }
}

impl Startable for Router {
    fn start(self: Arc<Self>, _ctx: &Context, wg: &WaitGroup, _flow_cancel: &CancelHandle) -> Result<()> {
        debug!("flow {}: starting router with {} outputs", self.flow_id.short(), self.outputs.len());
        for (idx, output) in self.outputs.iter().enumerate() {
            let output = Arc::clone(output);
            let wg = wg.clone();
            thread::Builder::new()
                .name(format!("router-{}-{}", self.flow_id.short(), idx))
                .spawn(move || {
                    output.run();
                    drop(wg);
                })?;
        }
        Ok(())
    }
}
