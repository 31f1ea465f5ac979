use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stream ID type. Only unique within the flow that declares it.
pub type StreamId = i32;

/// Node (machine) ID type
pub type NodeId = u32;

/// Processor ID type, as assigned by the plan compiler
pub type ProcessorId = i32;

/// Globally unique identifier of one distributed query execution.
///
/// Every stream ID used by the flow's participants is scoped by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Mint a fresh random flow ID
    pub fn new_random() -> Self {
        FlowId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        FlowId(uuid)
    }

    /// The nil flow ID, used by purely local flows that never register
    pub fn nil() -> Self {
        FlowId(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First 8 hex digits, for log lines and thread names
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
