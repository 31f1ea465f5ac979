// Common Infrastructure
//
// Identifiers, cluster settings, cancellation contexts and memory accounting
// shared by every flow component.

pub mod context;
pub mod memory;
pub mod settings;
pub mod types;

pub use context::{CancelHandle, Context};
pub use memory::{BoundAccount, MemoryMonitor};
pub use settings::Settings;
pub use types::{FlowId, NodeId, ProcessorId, StreamId};
