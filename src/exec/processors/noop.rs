// Noop Processor
//
// Forwards its single input unchanged. Useful as a pure synchronization
// point, e.g. merging remote streams on the gateway.

use crate::exec::receiver::{Message, RowSource};

pub struct Noop {
    input: Box<dyn RowSource>,
}

impl Noop {
    pub fn new(input: Box<dyn RowSource>) -> Self {
        Noop { input }
    }
}

impl RowSource for Noop {
    fn next(&mut self) -> Option<Message> {
        self.input.next()
    }

    fn consumer_done(&mut self) {
        self.input.consumer_done();
    }

    fn consumer_closed(&mut self) {
        self.input.consumer_closed();
    }
}
