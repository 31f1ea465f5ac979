// Execution Components
//
// Rows, errors, the push/pull stream capabilities and every component that
// implements them: synchronizers, routers and processors.

pub mod error;
pub mod expr;
pub mod processors;
pub mod receiver;
pub mod router;
pub mod row;
pub mod sync;

pub use error::{FlowError, Result};
pub use receiver::{ConsumerStatus, Message, ProducerMetadata, RowBuffer, RowReceiver, RowSource};
pub use row::{ColumnOrdering, DataValue, Row};
