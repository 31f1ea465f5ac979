// Values Processor
//
// Emits a fixed list of literal rows. Has no inputs.

use std::collections::VecDeque;

use crate::exec::receiver::{Message, RowSource};
use crate::exec::row::{DataValue, Row};

pub struct Values {
    rows: VecDeque<Row>,
}

impl Values {
    pub fn new(rows: &[Vec<DataValue>]) -> Self {
        Values {
            rows: rows.iter().cloned().map(Row::new).collect(),
        }
    }
}

impl RowSource for Values {
    fn next(&mut self) -> Option<Message> {
        self.rows.pop_front().map(Message::Row)
    }

    // Nothing but rows to produce, so draining ends the output.
    fn consumer_done(&mut self) {
        self.rows.clear();
    }

    fn consumer_closed(&mut self) {
        self.rows.clear();
    }
}
