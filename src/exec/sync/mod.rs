// Input Synchronizers
//
// Fan-in points: the unordered row channel and the ordered merge.

pub mod ordered;
pub mod row_channel;

pub use ordered::OrderedSynchronizer;
pub use row_channel::{row_channel, RowChannel, RowChannelSource};
