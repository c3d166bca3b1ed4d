//! Statement descriptors: what to run, with which parameters, over which page.

use crate::mapping::{ColumnMapper, ResultMapper};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// How the statement is handed to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatementType {
    /// Plain statement with inlined text
    Statement,
    /// Prepared statement with bound parameters
    #[default]
    Prepared,
    /// Call-style statement (stored procedure) that may write output parameters
    Callable,
}

/// The kind of SQL command a statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlCommandType {
    Select,
    Insert,
    Update,
    Delete,
}

impl SqlCommandType {
    /// Whether the command reads rows.
    pub const fn is_select(self) -> bool {
        matches!(self, SqlCommandType::Select)
    }
}

/// Direction of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterMode {
    #[default]
    In,
    Out,
    InOut,
}

/// Binding of one placeholder to a property of the parameter object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub property: String,
    pub mode: ParameterMode,
}

impl ParameterMapping {
    /// An input parameter bound to `property`.
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            mode: ParameterMode::In,
        }
    }

    /// Set the parameter direction.
    #[must_use]
    pub fn mode(mut self, mode: ParameterMode) -> Self {
        self.mode = mode;
        self
    }

    /// Does the database read this parameter?
    pub const fn is_input(&self) -> bool {
        !matches!(self.mode, ParameterMode::Out)
    }

    /// Does the database write this parameter?
    pub const fn is_output(&self) -> bool {
        !matches!(self.mode, ParameterMode::In)
    }
}

/// The parameter object passed alongside a statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Params {
    /// No parameter object
    #[default]
    Empty,
    /// A single scalar value; every property lookup resolves to it
    Scalar(Value),
    /// Named properties
    Named(BTreeMap<String, Value>),
}

impl Params {
    /// Start an empty named parameter object.
    pub fn named() -> Self {
        Params::Named(BTreeMap::new())
    }

    /// Builder-style insert of a named property.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Empty => true,
            Params::Scalar(_) => false,
            Params::Named(map) => map.is_empty(),
        }
    }

    /// Resolve a property. A scalar answers every name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Params::Empty => None,
            Params::Scalar(v) => Some(v),
            Params::Named(map) => map.get(name),
        }
    }

    /// Write a property. An empty object becomes a named one; a scalar is replaced.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        match self {
            Params::Named(map) => {
                map.insert(name.into(), value.into());
            }
            Params::Scalar(v) => *v = value.into(),
            Params::Empty => {
                let mut map = BTreeMap::new();
                map.insert(name.into(), value.into());
                *self = Params::Named(map);
            }
        }
    }
}

impl From<Value> for Params {
    fn from(v: Value) -> Self {
        Params::Scalar(v)
    }
}

/// Rendered statement text together with its parameter bindings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundSql {
    pub sql: String,
    pub parameter_mappings: Vec<ParameterMapping>,
    /// Values generated while rendering (loop variables and similar); they
    /// shadow properties of the parameter object.
    pub additional_parameters: BTreeMap<String, Value>,
}

impl BoundSql {
    pub fn new(sql: impl Into<String>, parameter_mappings: Vec<ParameterMapping>) -> Self {
        Self {
            sql: sql.into(),
            parameter_mappings,
            additional_parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_additional_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.additional_parameters.insert(name.into(), value.into());
        self
    }

    /// Value bound to `property`, in lookup order: additional parameters,
    /// then the parameter object. A missing object or property binds NULL.
    pub fn parameter_value(&self, params: &Params, property: &str) -> Value {
        if let Some(v) = self.additional_parameters.get(property) {
            return v.clone();
        }
        params.get(property).cloned().unwrap_or(Value::Null)
    }
}

/// Pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBounds {
    pub offset: usize,
    pub limit: usize,
}

impl RowBounds {
    pub const NO_ROW_OFFSET: usize = 0;
    pub const NO_ROW_LIMIT: usize = usize::MAX;

    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

impl Default for RowBounds {
    fn default() -> Self {
        Self::new(Self::NO_ROW_OFFSET, Self::NO_ROW_LIMIT)
    }
}

/// A registered statement: identity, text, bindings and how results map.
#[derive(Clone)]
pub struct MappedStatement {
    id: String,
    statement_type: StatementType,
    command_type: SqlCommandType,
    flush_cache: bool,
    sql: String,
    parameter_mappings: Vec<ParameterMapping>,
    result_mapper: Arc<dyn ResultMapper>,
}

impl MappedStatement {
    /// Create a statement. Non-select commands flush the local cache by default.
    pub fn new(id: impl Into<String>, command_type: SqlCommandType, sql: impl Into<String>) -> Self {
        let id = id.into();
        let result_mapper: Arc<dyn ResultMapper> = Arc::new(ColumnMapper::new(id.clone()));
        Self {
            id,
            statement_type: StatementType::default(),
            command_type,
            flush_cache: !command_type.is_select(),
            sql: sql.into(),
            parameter_mappings: Vec::new(),
            result_mapper,
        }
    }

    /// Shorthand for a `SELECT` statement.
    pub fn select(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(id, SqlCommandType::Select, sql)
    }

    /// Shorthand for an `UPDATE` statement.
    pub fn update(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(id, SqlCommandType::Update, sql)
    }

    #[must_use]
    pub fn statement_type(mut self, statement_type: StatementType) -> Self {
        self.statement_type = statement_type;
        self
    }

    /// Force (or suppress) clearing the local cache before this statement runs.
    #[must_use]
    pub fn flush_cache(mut self, flush: bool) -> Self {
        self.flush_cache = flush;
        self
    }

    #[must_use]
    pub fn parameter(mut self, mapping: ParameterMapping) -> Self {
        self.parameter_mappings.push(mapping);
        self
    }

    #[must_use]
    pub fn result_mapper(mut self, mapper: impl ResultMapper + 'static) -> Self {
        self.result_mapper = Arc::new(mapper);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> StatementType {
        self.statement_type
    }

    pub fn command_type(&self) -> SqlCommandType {
        self.command_type
    }

    pub fn is_flush_cache_required(&self) -> bool {
        self.flush_cache
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameter_mappings(&self) -> &[ParameterMapping] {
        &self.parameter_mappings
    }

    pub fn mapper(&self) -> &Arc<dyn ResultMapper> {
        &self.result_mapper
    }

    /// Render the statement for `params`.
    pub fn bound_sql(&self, _params: &Params) -> BoundSql {
        BoundSql::new(self.sql.clone(), self.parameter_mappings.clone())
    }
}

impl fmt::Debug for MappedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedStatement")
            .field("id", &self.id)
            .field("statement_type", &self.statement_type)
            .field("command_type", &self.command_type)
            .field("flush_cache", &self.flush_cache)
            .field("sql", &self.sql)
            .field("parameter_mappings", &self.parameter_mappings)
            .field("result_mapper", &self.result_mapper)
            .finish()
    }
}
