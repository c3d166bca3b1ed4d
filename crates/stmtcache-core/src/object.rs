//! Materialized result objects and the plumbing that carries them.

use crate::error::{Error, ExecutorError, ExecutorErrorKind, Result};
use crate::row::Row;
use crate::statement::Params;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed, sendable future used at object-safe async seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The cached result of one query: the materialized objects in row order.
pub type QueryResult = Arc<Vec<ResultObject>>;

/// A property slot on a [`ResultObject`].
#[derive(Clone)]
pub enum Property {
    /// Plain column value
    Value(Value),
    /// Single-valued association
    One(Option<ResultObject>),
    /// Collection association
    Many(Vec<ResultObject>),
}

impl fmt::Debug for Property {
    // Associations print as counts: object graphs may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Value(v) => write!(f, "{v:?}"),
            Property::One(Some(obj)) => write!(f, "One({})", obj.type_name()),
            Property::One(None) => write!(f, "One(None)"),
            Property::Many(items) => write!(f, "Many(len={})", items.len()),
        }
    }
}

struct ObjectData {
    type_name: String,
    properties: BTreeMap<String, Property>,
}

/// A shared handle to a materialized object.
///
/// Clones refer to the same object, so a deferred assignment made through one
/// handle is visible through every other (including the copy held in a
/// cached result).
#[derive(Clone)]
pub struct ResultObject {
    inner: Arc<Mutex<ObjectData>>,
}

impl ResultObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObjectData {
                type_name: type_name.into(),
                properties: BTreeMap::new(),
            })),
        }
    }

    /// Build an object holding one value property per column of `row`.
    pub fn from_row(type_name: impl Into<String>, row: &Row) -> Self {
        let obj = Self::new(type_name);
        {
            let mut data = obj.inner.lock();
            for (name, value) in row.iter() {
                data.properties
                    .insert(name.to_string(), Property::Value(value.clone()));
            }
        }
        obj
    }

    pub fn type_name(&self) -> String {
        self.inner.lock().type_name.clone()
    }

    pub fn get(&self, property: &str) -> Option<Property> {
        self.inner.lock().properties.get(property).cloned()
    }

    /// Convenience accessor for a value property.
    pub fn value(&self, property: &str) -> Option<Value> {
        match self.get(property) {
            Some(Property::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Convenience accessor for a single-valued association.
    pub fn one(&self, property: &str) -> Option<ResultObject> {
        match self.get(property) {
            Some(Property::One(obj)) => obj,
            _ => None,
        }
    }

    /// Convenience accessor for a collection association.
    pub fn many(&self, property: &str) -> Vec<ResultObject> {
        match self.get(property) {
            Some(Property::Many(items)) => items,
            _ => Vec::new(),
        }
    }

    pub fn set(&self, property: impl Into<String>, value: Property) {
        self.inner.lock().properties.insert(property.into(), value);
    }

    pub fn set_value(&self, property: impl Into<String>, value: impl Into<Value>) {
        self.set(property, Property::Value(value.into()));
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.inner.lock().properties.contains_key(property)
    }

    pub fn property_names(&self) -> Vec<String> {
        self.inner.lock().properties.keys().cloned().collect()
    }

    /// Do both handles refer to the same object?
    pub fn ptr_eq(&self, other: &ResultObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ResultObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("ResultObject")
            .field("type_name", &data.type_name)
            .field("properties", &data.properties)
            .finish()
    }
}

/// Shape of the value a deferred or nested load assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    /// A single object (or none)
    One,
    /// The full list
    Many,
}

impl TargetType {
    /// Turn a query result into the property value this target expects.
    ///
    /// `One` accepts zero or one objects; more is an error.
    #[allow(clippy::result_large_err)]
    pub fn extract(self, objects: &[ResultObject]) -> Result<Property> {
        match self {
            TargetType::Many => Ok(Property::Many(objects.to_vec())),
            TargetType::One => match objects {
                [] => Ok(Property::One(None)),
                [single] => Ok(Property::One(Some(single.clone()))),
                _ => Err(Error::Executor(ExecutorError {
                    kind: ExecutorErrorKind::TooManyResults,
                    statement_id: None,
                    message: "Statement returned more than one row, where no more than one was expected."
                        .to_string(),
                })),
            },
        }
    }
}

/// Receives materialized objects one by one instead of collecting them.
pub trait ResultSink: Send {
    fn handle(&mut self, object: ResultObject);

    /// Has the sink seen enough? Checked after every object.
    fn stopped(&self) -> bool {
        false
    }
}

/// A sink that keeps everything it is handed.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub objects: Vec<ResultObject>,
}

impl ResultSink for CollectingSink {
    fn handle(&mut self, object: ResultObject) {
        self.objects.push(object);
    }
}

/// Lazily produced rows from a streaming query.
pub struct RowCursor {
    rows: Option<Box<dyn Iterator<Item = Result<Row>> + Send>>,
    index: usize,
    consumed: bool,
}

impl RowCursor {
    pub fn new(rows: impl Iterator<Item = Result<Row>> + Send + 'static) -> Self {
        Self {
            rows: Some(Box::new(rows)),
            index: 0,
            consumed: false,
        }
    }

    /// Cursor over rows that are already in memory.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self::new(rows.into_iter().map(Ok))
    }

    /// Fetch the next row; `Ok(None)` once exhausted or closed.
    #[allow(clippy::result_large_err)]
    pub fn fetch(&mut self) -> Result<Option<Row>> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        match rows.next() {
            Some(Ok(row)) => {
                self.index += 1;
                Ok(Some(row))
            }
            Some(Err(e)) => Err(e),
            None => {
                self.consumed = true;
                self.rows = None;
                Ok(None)
            }
        }
    }

    /// Release the underlying row source.
    pub fn close(&mut self) {
        self.rows = None;
    }

    pub fn is_open(&self) -> bool {
        self.rows.is_some()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Number of rows fetched so far.
    pub fn current_index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCursor")
            .field("open", &self.is_open())
            .field("index", &self.index)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// Outcome of one batched statement after a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub statement_id: String,
    pub sql: String,
    pub parameters: Vec<Params>,
    pub update_counts: Vec<u64>,
}
