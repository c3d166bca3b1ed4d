//! Result mapper with nested-select associations.

use asupersync::{Cx, Outcome};
use std::sync::Arc;
use stmtcache_core::{
    BoxFuture, ColumnMapper, Error, MappedStatement, NestedQuery, Params, ResultMapper,
    ResultObject, Row, RowBounds, TargetType, Value,
};

/// An association resolved by running another statement per parent row.
#[derive(Debug, Clone)]
pub struct NestedSelect {
    /// Property assigned on the parent object
    pub property: String,
    /// Statement producing the associated objects
    pub statement: Arc<MappedStatement>,
    /// Parent column whose value parameterizes the nested statement
    pub column: String,
    /// Name the column value is bound to in the nested parameters
    pub parameter: String,
    /// Single object or full list
    pub target_type: TargetType,
}

impl NestedSelect {
    pub fn new(
        property: impl Into<String>,
        statement: Arc<MappedStatement>,
        column: impl Into<String>,
        target_type: TargetType,
    ) -> Self {
        let column = column.into();
        Self {
            property: property.into(),
            statement,
            parameter: column.clone(),
            column,
            target_type,
        }
    }

    /// Bind the column value under a different parameter name.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameter = name.into();
        self
    }

    fn params_for(&self, row: &Row) -> Params {
        let value = row.get_by_name(&self.column).cloned().unwrap_or(Value::Null);
        Params::named().with(self.parameter.clone(), value)
    }
}

/// Column mapping plus nested selects.
///
/// A nested select whose key is already in flight or present in the
/// executor's local cache is deferred; otherwise it runs through the executor
/// immediately.
#[derive(Debug, Clone)]
pub struct NestedSelectMapper {
    columns: ColumnMapper,
    nested: Vec<NestedSelect>,
}

impl NestedSelectMapper {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            columns: ColumnMapper::new(type_name),
            nested: Vec::new(),
        }
    }

    #[must_use]
    pub fn nested(mut self, select: NestedSelect) -> Self {
        self.nested.push(select);
        self
    }
}

impl ResultMapper for NestedSelectMapper {
    fn map_rows<'a>(
        &'a self,
        nested: &'a mut dyn NestedQuery,
        cx: &'a Cx,
        rows: Vec<Row>,
    ) -> BoxFuture<'a, Outcome<Vec<ResultObject>, Error>> {
        Box::pin(async move {
            let mut objects = Vec::with_capacity(rows.len());
            for row in &rows {
                let object = ResultObject::from_row(self.columns.type_name(), row);
                for select in &self.nested {
                    let mut params = select.params_for(row);
                    let statement = Arc::clone(&select.statement);
                    let bound = statement.bound_sql(&params);
                    let key = match nested.create_cache_key(
                        &statement,
                        &params,
                        RowBounds::default(),
                        &bound,
                    ) {
                        Ok(key) => key,
                        Err(e) => return Outcome::Err(e),
                    };

                    if nested.is_cached(&key) {
                        if let Err(e) =
                            nested.defer_load(&object, &select.property, key, select.target_type)
                        {
                            return Outcome::Err(e);
                        }
                        continue;
                    }

                    let result = match nested
                        .query(cx, &statement, &mut params, RowBounds::default())
                        .await
                    {
                        Outcome::Ok(result) => result,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    match select.target_type.extract(&result) {
                        Ok(value) => object.set(select.property.clone(), value),
                        Err(e) => return Outcome::Err(e),
                    }
                }
                objects.push(object);
            }
            Outcome::Ok(objects)
        })
    }
}
