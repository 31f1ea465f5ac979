use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::exec::error::{FlowError, Result};
use crate::exec::row::Row;

/// An immutable, in-memory table
#[derive(Debug)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>, rows: Vec<Row>) -> Self {
        Table {
            name: name.into(),
            columns,
            rows,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// The tables a node can scan, shared by every flow running on it
#[derive(Debug, Default)]
pub struct TableCatalog {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, replacing any table of the same name
    pub fn create_table(&self, table: Table) -> Arc<Table> {
        let table = Arc::new(table);
        self.tables
            .write()
            .insert(table.name().to_string(), Arc::clone(&table));
        table
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::TableNotFound(name.to_string()))
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.tables
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FlowError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}
