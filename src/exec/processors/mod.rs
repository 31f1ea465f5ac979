// Processors
//
// A processor is one stage of computation: a core pulling from zero or more
// inputs, post-processing applied to what the core produces, and a single
// output receiver. A processor either runs on a task of its own, pushing
// into its output, or is fused into its consumer, which then pulls from it
// directly as a row source.

pub mod filterer;
pub mod noop;
pub mod post;
pub mod sorter;
pub mod table_reader;
pub mod values;

use std::sync::Arc;

use log::{debug, trace};

use crate::common::context::Context;
use crate::common::types::ProcessorId;
use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::{ConsumerStatus, Message, RowReceiver, RowSource};
use crate::flow::ctx::FlowCtx;
use crate::flow::spec::{ProcessorCoreSpec, ProcessorSpec};

pub use filterer::Filterer;
pub use noop::Noop;
pub use post::PostProcessor;
pub use sorter::Sorter;
pub use table_reader::TableReader;
pub use values::Values;

/// A fully wired processor, ready to run
pub struct Processor {
    id: ProcessorId,
    name: &'static str,
    source: Box<dyn RowSource>,
    output: Arc<dyn RowReceiver>,
}

impl Processor {
    pub fn new(
        id: ProcessorId,
        name: &'static str,
        source: Box<dyn RowSource>,
        output: Arc<dyn RowReceiver>,
    ) -> Self {
        Processor {
            id,
            name,
            source,
            output,
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Give up the output and expose the processor as a pull-based source
    /// for the consumer it is fused into.
    pub fn into_source(self) -> Box<dyn RowSource> {
        self.source
    }

    /// Push everything the processor produces into its output, honoring the
    /// consumer's status, and signal `producer_done` exactly once.
    pub fn run(mut self, ctx: &Context) {
        debug!("processor {} ({}) starting", self.id, self.name);
        let mut rows = 0u64;
        // Once an input error has gone out, cancellation adds no second one.
        let mut error_forwarded = false;
        loop {
            if ctx.is_canceled() {
                debug!("processor {} ({}) canceled", self.id, self.name);
                if !error_forwarded {
                    self.output.push(Message::error(FlowError::QueryCanceled));
                }
                self.source.consumer_closed();
                break;
            }
            let Some(msg) = self.source.next() else {
                break;
            };
            match &msg {
                Message::Row(_) => rows += 1,
                Message::Meta(meta) => error_forwarded |= meta.err.is_some(),
            }
            match self.output.push(msg) {
                ConsumerStatus::NeedMoreRows => {}
                ConsumerStatus::DrainRequested => {
                    trace!("processor {}: consumer requested drain", self.id);
                    self.source.consumer_done();
                }
                ConsumerStatus::ConsumerClosed => {
                    trace!("processor {}: consumer closed", self.id);
                    self.source.consumer_closed();
                    break;
                }
            }
        }
        self.output.producer_done();
        debug!("processor {} ({}) done after {} rows", self.id, self.name, rows);
    }
}

/// Instantiate a processor from its spec and its resolved inputs and output
pub fn new_processor(
    flow_ctx: &FlowCtx,
    spec: &ProcessorSpec,
    inputs: Vec<Box<dyn RowSource>>,
    output: Arc<dyn RowReceiver>,
) -> Result<Processor> {
    let expected = spec.core.num_inputs();
    if inputs.len() != expected {
        return Err(FlowError::InputArity {
            expected,
            actual: inputs.len(),
        });
    }
    let mut inputs = inputs.into_iter();
    let mut input = || {
        inputs
            .next()
            .ok_or_else(|| FlowError::Internal("missing processor input".to_string()))
    };

    let core: Box<dyn RowSource> = match &spec.core {
        ProcessorCoreSpec::Values { rows } => Box::new(Values::new(rows)),
        ProcessorCoreSpec::TableReader { table, start, end } => {
            Box::new(TableReader::new(&flow_ctx.tables, table, *start, *end))
        }
        ProcessorCoreSpec::Noop => Box::new(Noop::new(input()?)),
        ProcessorCoreSpec::Filterer { filter } => Box::new(Filterer::new(input()?, filter.clone())),
        ProcessorCoreSpec::Sorter { ordering } => {
            Box::new(Sorter::new(input()?, ordering.clone(), &flow_ctx.monitor))
        }
    };
    let source = Box::new(PostProcessor::new(core, spec.post.clone()));
    Ok(Processor::new(spec.processor_id, spec.core.name(), source, output))
}
