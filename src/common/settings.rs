// Cluster Settings
//
// Tunables consumed by the flow runtime. The inbound stream timeout may be
// changed while the node is running; it is read whenever a flow registers.

use std::time::Duration;

use parking_lot::RwLock;

/// Default time a flow waits for its remote inbound streams to connect
pub const DEFAULT_FLOW_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of rows buffered in a row channel before producers block
pub const DEFAULT_ROW_CHANNEL_CAPACITY: usize = 16;

/// Default number of rows an outbox accumulates before sending a batch
pub const DEFAULT_OUTBOX_BUFFER_ROWS: usize = 16;

/// Default maximum time an outbox holds on to a partial batch
pub const DEFAULT_OUTBOX_FLUSH_PERIOD: Duration = Duration::from_micros(100);

/// Node-wide settings shared by every flow the node runs
#[derive(Debug)]
pub struct Settings {
    /// Inbound stream connection timeout
    flow_stream_timeout: RwLock<Duration>,

    /// Capacity of every row channel created during flow setup
    pub row_channel_capacity: usize,

    /// Rows per outbox batch
    pub outbox_buffer_rows: usize,

    /// Flush interval for partially filled outbox batches
    pub outbox_flush_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flow_stream_timeout: RwLock::new(DEFAULT_FLOW_STREAM_TIMEOUT),
            row_channel_capacity: DEFAULT_ROW_CHANNEL_CAPACITY,
            outbox_buffer_rows: DEFAULT_OUTBOX_BUFFER_ROWS,
            outbox_flush_period: DEFAULT_OUTBOX_FLUSH_PERIOD,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow_stream_timeout(self, timeout: Duration) -> Self {
        *self.flow_stream_timeout.write() = timeout;
        self
    }

    pub fn with_row_channel_capacity(mut self, capacity: usize) -> Self {
        self.row_channel_capacity = capacity.max(1);
        self
    }

    pub fn with_outbox_buffer_rows(mut self, rows: usize) -> Self {
        self.outbox_buffer_rows = rows.max(1);
        self
    }

    pub fn with_outbox_flush_period(mut self, period: Duration) -> Self {
        self.outbox_flush_period = period;
        self
    }

    /// Current inbound stream connection timeout
    pub fn flow_stream_timeout(&self) -> Duration {
        *self.flow_stream_timeout.read()
    }

    /// Change the timeout; flows registered afterwards pick it up
    pub fn set_flow_stream_timeout(&self, timeout: Duration) {
        *self.flow_stream_timeout.write() = timeout;
    }
}
