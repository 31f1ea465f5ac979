// Flow Context
//
// The immutable per-flow configuration handed to every component that needs
// node identity, settings, memory accounting or the network.

use std::fmt;
use std::sync::Arc;

use crate::catalog::TableCatalog;
use crate::common::memory::{BoundAccount, MemoryMonitor};
use crate::common::settings::Settings;
use crate::common::types::{FlowId, NodeId};
use crate::net::transport::Dialer;

/// Hooks that let tests alter flow construction
#[derive(Debug, Clone, Default)]
pub struct TestingKnobs {
    /// Give every processor its own task, even when it could be fused
    pub disable_fusion: bool,
}

/// Everything a flow's components share
pub struct FlowCtx {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub settings: Arc<Settings>,
    pub monitor: Arc<MemoryMonitor>,
    /// Scratch space for expression evaluation, cleared per result row
    pub eval_account: Arc<BoundAccount>,
    pub tables: Arc<TableCatalog>,
    /// Used by outboxes to reach other nodes; absent on single-node setups
    pub dialer: Option<Arc<dyn Dialer>>,
    pub testing_knobs: TestingKnobs,
}

impl FlowCtx {
    pub fn new(
        flow_id: FlowId,
        node_id: NodeId,
        settings: Arc<Settings>,
        monitor: Arc<MemoryMonitor>,
        tables: Arc<TableCatalog>,
    ) -> Self {
        let eval_account = monitor.make_account();
        FlowCtx {
            flow_id,
            node_id,
            settings,
            monitor,
            eval_account,
            tables,
            dialer: None,
            testing_knobs: TestingKnobs::default(),
        }
    }

    /// A context with default settings, an unlimited monitor and an empty
    /// catalog
    pub fn local(flow_id: FlowId) -> Self {
        Self::new(
            flow_id,
            0,
            Arc::new(Settings::default()),
            MemoryMonitor::unlimited("flow"),
            Arc::new(TableCatalog::new()),
        )
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_testing_knobs(mut self, knobs: TestingKnobs) -> Self {
        self.testing_knobs = knobs;
        self
    }
}

impl fmt::Debug for FlowCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowCtx")
            .field("flow_id", &self.flow_id)
            .field("node_id", &self.node_id)
            .field("has_dialer", &self.dialer.is_some())
            .field("testing_knobs", &self.testing_knobs)
            .finish()
    }
}
