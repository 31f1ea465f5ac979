// Flows
//
// A flow is one node's live share of a distributed query: its processors,
// the synchronizers, routers and outboxes wiring them together, and the
// registry through which remote producers reach its inbound streams.

pub mod ctx;
#[allow(clippy::module_inception)]
pub mod flow;
pub mod graph;
pub mod inbound;
pub mod outbox;
pub mod registry;
pub mod spec;

use std::sync::Arc;

use crossbeam::sync::WaitGroup;

use crate::common::context::{CancelHandle, Context};
use crate::exec::error::Result;

pub use ctx::{FlowCtx, TestingKnobs};
pub use flow::{Flow, FlowStatus};
pub use graph::{FlowGraph, FusionPlan};
pub use registry::{ConnectedStream, FlowRegistry, InboundStreamInfo};
pub use spec::FlowSpec;

/// A component with a task of its own (routers and outboxes), started
/// before any processor runs. Each task holds a clone of the flow's wait
/// group until it finishes.
pub trait Startable: Send + Sync {
    fn start(self: Arc<Self>, ctx: &Context, wg: &WaitGroup, flow_cancel: &CancelHandle) -> Result<()>;
}
