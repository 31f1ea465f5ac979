// Bayun Flow Engine
//
// Distributed execution of query flows: each node runs its share of a
// query as a graph of processors connected by local and remote streams.

pub mod catalog;
pub mod common;
pub mod exec;
pub mod flow;
pub mod net;
pub mod server;

// Re-export key items for convenient access
pub use catalog::{Table, TableCatalog};
pub use common::{Context, FlowId, NodeId, Settings, StreamId};
pub use exec::{ColumnOrdering, DataValue, FlowError, Message, Result, Row, RowBuffer, RowReceiver, RowSource};
pub use flow::{Flow, FlowCtx, FlowRegistry, FlowSpec, FlowStatus};
pub use net::LocalNetwork;
pub use server::FlowServer;
