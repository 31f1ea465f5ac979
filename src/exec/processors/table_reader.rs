// Table Reader Processor
//
// Scans a table from the node's catalog, optionally restricted to a row
// range. A missing table is reported to the consumer as error metadata.

use std::sync::Arc;

use log::debug;

use crate::catalog::{Table, TableCatalog};
use crate::exec::error::Result;
use crate::exec::receiver::{Message, RowSource};

pub struct TableReader {
    table: Result<Arc<Table>>,
    pos: usize,
    end: usize,
    finished: bool,
}

impl TableReader {
    pub fn new(catalog: &TableCatalog, name: &str, start: Option<usize>, end: Option<usize>) -> Self {
        let table = catalog.get_table(name);
        let (pos, end) = match &table {
            Ok(t) => {
                let end = end.unwrap_or(t.num_rows()).min(t.num_rows());
                (start.unwrap_or(0).min(end), end)
            }
            Err(_) => (0, 0),
        };
        debug!("table reader on {}: rows [{}, {})", name, pos, end);
        TableReader {
            table,
            pos,
            end,
            finished: false,
        }
    }
}

impl RowSource for TableReader {
    fn next(&mut self) -> Option<Message> {
        if self.finished {
            return None;
        }
        let table = match &self.table {
            Ok(table) => table,
            Err(err) => {
                self.finished = true;
                return Some(Message::error(err.clone()));
            }
        };
        if self.pos >= self.end {
            self.finished = true;
            return None;
        }
        let row = table.rows()[self.pos].clone();
        self.pos += 1;
        Some(Message::Row(row))
    }

    fn consumer_done(&mut self) {
        self.finished = true;
    }

    fn consumer_closed(&mut self) {
        self.finished = true;
    }
}
