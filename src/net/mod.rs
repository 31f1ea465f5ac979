// Network Glue
//
// Wire framing, transport interfaces and an in-process transport.

pub mod local;
pub mod transport;
pub mod wire;

pub use local::LocalNetwork;
pub use transport::{Dialer, FlowService, InboundConn, OutboundConn};
pub use wire::{ConsumerSignal, ProducerFrame};
