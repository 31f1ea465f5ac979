//! Table Catalog Module
//!
//! In-memory tables that table readers scan. One catalog per node.

pub mod catalog;

pub use self::catalog::{Table, TableCatalog};
