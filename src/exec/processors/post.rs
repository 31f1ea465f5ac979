// Post-Processing
//
// Applies a processor's PostProcessSpec (filter, offset, limit, projection)
// to everything its core produces. Reaching the limit puts the processor
// into draining mode: the core is asked to drain and only metadata is
// forwarded from then on. The same happens after any error.

use log::trace;

use crate::exec::error::FlowError;
use crate::exec::receiver::{Message, RowSource};
use crate::exec::row::{DataValue, Row};
use crate::flow::spec::PostProcessSpec;

/// Wraps a processor core, shaping its output
pub struct PostProcessor {
    core: Box<dyn RowSource>,
    spec: PostProcessSpec,
    /// Rows that passed the filter, offset ones included
    rows_seen: u64,
    rows_emitted: u64,
    draining: bool,
}

impl PostProcessor {
    pub fn new(core: Box<dyn RowSource>, spec: PostProcessSpec) -> Self {
        PostProcessor {
            core,
            spec,
            rows_seen: 0,
            rows_emitted: 0,
            draining: false,
        }
    }

    fn start_draining(&mut self) {
        if !self.draining {
            self.draining = true;
            self.core.consumer_done();
        }
    }

    fn limit_reached(&self) -> bool {
        matches!(self.spec.limit, Some(limit) if self.rows_emitted >= limit)
    }

    fn project(&self, row: Row) -> Result<Row, FlowError> {
        let Some(columns) = &self.spec.projection else {
            return Ok(row);
        };
        let mut values: Vec<DataValue> = Vec::with_capacity(columns.len());
        for &idx in columns {
            let value = row.get(idx).ok_or(FlowError::ColumnOutOfRange {
                index: idx,
                width: row.len(),
            })?;
            values.push(value.clone());
        }
        Ok(Row::new(values))
    }

    /// Run one row through filter, offset, limit and projection
    fn process_row(&mut self, row: Row) -> Result<Option<Row>, FlowError> {
        if let Some(filter) = &self.spec.filter {
            if !filter.passes(&row)? {
                return Ok(None);
            }
        }
        self.rows_seen += 1;
        if self.rows_seen <= self.spec.offset {
            return Ok(None);
        }
        let row = self.project(row)?;
        self.rows_emitted += 1;
        if self.limit_reached() {
            trace!("limit of {} rows reached, draining", self.rows_emitted);
            self.start_draining();
        }
        Ok(Some(row))
    }
}

impl RowSource for PostProcessor {
    fn next(&mut self) -> Option<Message> {
        if self.limit_reached() {
            self.start_draining();
        }
        loop {
            match self.core.next()? {
                Message::Row(row) => {
                    if self.draining {
                        continue;
                    }
                    match self.process_row(row) {
                        Ok(Some(row)) => return Some(Message::Row(row)),
                        Ok(None) => continue,
                        Err(err) => {
                            self.start_draining();
                            return Some(Message::error(err));
                        }
                    }
                }
                Message::Meta(meta) => {
                    if meta.err.is_some() {
                        self.start_draining();
                    }
                    return Some(Message::Meta(meta));
                }
            }
        }
    }

    fn consumer_done(&mut self) {
        self.start_draining();
    }

    fn consumer_closed(&mut self) {
        self.draining = true;
        self.core.consumer_closed();
    }
}
