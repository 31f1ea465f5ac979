// Row and Value Types
//
// This module defines the values and rows that flow between processors,
// together with the column orderings used to sort and merge them.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Possible data types for values in a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Blob(Vec<u8>),
}

impl Eq for DataValue {}

impl Hash for DataValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            DataValue::Null => 0.hash(state),
            DataValue::Integer(i) => { 1.hash(state); i.hash(state); }
            DataValue::Float(f) => { 2.hash(state); f.to_bits().hash(state); }
            DataValue::Text(s) => { 3.hash(state); s.hash(state); }
            DataValue::Boolean(b) => { 4.hash(state); b.hash(state); }
            DataValue::Blob(b) => { 5.hash(state); b.hash(state); }
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => write!(f, "NULL"),
            DataValue::Integer(i) => write!(f, "{}", i),
            DataValue::Float(fl) => write!(f, "{}", fl),
            DataValue::Text(s) => write!(f, "\"{}\"", s),
            DataValue::Boolean(b) => write!(f, "{}", b),
            DataValue::Blob(b) => write!(f, "BLOB ({} bytes)", b.len()),
        }
    }
}

impl PartialOrd for DataValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (DataValue::Null, DataValue::Null) => Some(Ordering::Equal),
            (DataValue::Null, _) => Some(Ordering::Less),
            (_, DataValue::Null) => Some(Ordering::Greater),

            (DataValue::Integer(a), DataValue::Integer(b)) => a.partial_cmp(b),
            (DataValue::Float(a), DataValue::Float(b)) => a.partial_cmp(b),
            (DataValue::Integer(a), DataValue::Float(b)) => (*a as f64).partial_cmp(b),
            (DataValue::Float(a), DataValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (DataValue::Text(a), DataValue::Text(b)) => Some(a.cmp(b)),
            (DataValue::Boolean(a), DataValue::Boolean(b)) => a.partial_cmp(b),
            (DataValue::Blob(a), DataValue::Blob(b)) => Some(a.cmp(b)),

            _ => None,
        }
    }
}

impl DataValue {
    /// Rank of the value's type in the total order; NULL sorts first
    fn type_rank(&self) -> u8 {
        match self {
            DataValue::Null => 0,
            DataValue::Boolean(_) => 1,
            DataValue::Integer(_) | DataValue::Float(_) => 2,
            DataValue::Text(_) => 3,
            DataValue::Blob(_) => 4,
        }
    }

    /// Total order over all values, used for sorting, merging and range
    /// routing. Comparable values keep their natural order; NaN sorts after
    /// every other number; otherwise values are ordered by type rank.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DataValue::Float(a), DataValue::Float(b)) => a.total_cmp(b),
            (DataValue::Integer(a), DataValue::Float(b)) => (*a as f64).total_cmp(b),
            (DataValue::Float(a), DataValue::Integer(b)) => a.total_cmp(&(*b as f64)),
            _ => match self.partial_cmp(other) {
                Some(ord) => ord,
                None => self.type_rank().cmp(&other.type_rank()),
            },
        }
    }

    /// Approximate in-memory footprint, used for memory accounting
    pub fn byte_size(&self) -> u64 {
        let payload = match self {
            DataValue::Text(s) => s.len(),
            DataValue::Blob(b) => b.len(),
            _ => 0,
        };
        (std::mem::size_of::<DataValue>() + payload) as u64
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }
}

/// A row of values, positionally addressed.
///
/// Clones share the underlying buffer; [`Row::detach`] gives the row a
/// private copy when the buffer is shared with someone else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    values: Arc<Vec<DataValue>>,
}

impl Row {
    pub fn new(values: Vec<DataValue>) -> Self {
        Row {
            values: Arc::new(values),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&DataValue> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[DataValue] {
        &self.values
    }

    /// Set a value, copying the buffer first if it is shared
    pub fn set(&mut self, idx: usize, value: DataValue) {
        let values = Arc::make_mut(&mut self.values);
        if idx < values.len() {
            values[idx] = value;
        }
    }

    /// Make sure no one else can observe this row's buffer
    pub fn detach(&mut self) {
        Arc::make_mut(&mut self.values);
    }

    /// Whether the buffer is shared with another row handle
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.values) > 1
    }

    pub fn byte_size(&self) -> u64 {
        self.values.iter().map(DataValue::byte_size).sum()
    }

    pub fn into_values(self) -> Vec<DataValue> {
        Arc::try_unwrap(self.values).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl From<Vec<DataValue>> for Row {
    fn from(values: Vec<DataValue>) -> Self {
        Row::new(values)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}

/// Sort direction of one ordering column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// One column of an ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOrderInfo {
    pub col_idx: usize,
    pub direction: Direction,
}

/// A lexicographic ordering over row columns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOrdering(pub Vec<ColumnOrderInfo>);

impl ColumnOrdering {
    pub fn new(columns: Vec<ColumnOrderInfo>) -> Self {
        ColumnOrdering(columns)
    }

    /// Ascending on the given columns
    pub fn asc(cols: &[usize]) -> Self {
        ColumnOrdering(
            cols.iter()
                .map(|&col_idx| ColumnOrderInfo { col_idx, direction: Direction::Asc })
                .collect(),
        )
    }

    /// Descending on the given columns
    pub fn desc(cols: &[usize]) -> Self {
        ColumnOrdering(
            cols.iter()
                .map(|&col_idx| ColumnOrderInfo { col_idx, direction: Direction::Desc })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn columns(&self) -> &[ColumnOrderInfo] {
        &self.0
    }

    /// Compare two rows under this ordering. Missing columns compare as NULL.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for info in &self.0 {
            let va = a.get(info.col_idx).unwrap_or(&DataValue::Null);
            let vb = b.get(info.col_idx).unwrap_or(&DataValue::Null);
            let ord = va.total_cmp(vb);
            if ord != Ordering::Equal {
                return match info.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
            }
        }
        Ordering::Equal
    }
}

/// Compare two key tuples position by position under the total order
pub fn compare_keys(a: &[DataValue], b: &[DataValue]) -> Ordering {
    for (va, vb) in a.iter().zip(b.iter()) {
        let ord = va.total_cmp(vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
