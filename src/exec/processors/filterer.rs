// Filterer Processor
//
// Keeps the input rows for which a boolean expression evaluates to TRUE.
// An evaluation error is forwarded as metadata and the input is drained.

use crate::exec::expr::Expr;
use crate::exec::receiver::{Message, RowSource};

pub struct Filterer {
    input: Box<dyn RowSource>,
    filter: Expr,
    draining: bool,
}

impl Filterer {
    pub fn new(input: Box<dyn RowSource>, filter: Expr) -> Self {
        Filterer {
            input,
            filter,
            draining: false,
        }
    }
}

impl RowSource for Filterer {
    fn next(&mut self) -> Option<Message> {
        loop {
            match self.input.next()? {
                Message::Row(row) => {
                    if self.draining {
                        continue;
                    }
                    match self.filter.passes(&row) {
                        Ok(true) => return Some(Message::Row(row)),
                        Ok(false) => continue,
                        Err(err) => {
                            self.consumer_done();
                            return Some(Message::error(err));
                        }
                    }
                }
                meta => return Some(meta),
            }
        }
    }

    fn consumer_done(&mut self) {
        if !self.draining {
            self.draining = true;
            self.input.consumer_done();
        }
    }

    fn consumer_closed(&mut self) {
        self.input.consumer_closed();
    }
}
