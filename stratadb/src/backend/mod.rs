//! The storage adapter contract.
//!
//! The engine talks to a relational backend exclusively through
//! [`DatabaseAdapter`]: it hands the adapter query text plus parameters and
//! gets rows of [`SqlValue`] back. Transactions compose through
//! [`with_root_transaction`] and [`TransactionContext::with_nested`]
//! (savepoints), so an inner failure rolls back only its own scope.

mod sqlite;

pub use sqlite::SqliteAdapter;

use crate::error::{RepositoryError, Result};
use std::cell::Cell;

/// A parameter or column value moving across the adapter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(value.into())
    }

    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(s) => SqlValue::Text(s.to_string()),
            None => SqlValue::Null,
        }
    }

    pub fn opt_integer(value: Option<i64>) -> Self {
        match value {
            Some(n) => SqlValue::Integer(n),
            None => SqlValue::Null,
        }
    }
}

/// One result row, addressed positionally in SELECT column order.
#[derive(Debug, Clone)]
pub struct SqlRow {
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        SqlRow { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn value(&self, index: usize) -> Result<&SqlValue> {
        self.values
            .get(index)
            .ok_or_else(|| RepositoryError::generic(format!("row has no column {index}")))
    }

    pub fn integer(&self, index: usize) -> Result<i64> {
        match self.value(index)? {
            SqlValue::Integer(n) => Ok(*n),
            other => Err(RepositoryError::generic(format!(
                "column {index}: expected integer, got {other:?}"
            ))),
        }
    }

    pub fn opt_integer(&self, index: usize) -> Result<Option<i64>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(n) => Ok(Some(*n)),
            other => Err(RepositoryError::generic(format!(
                "column {index}: expected integer or null, got {other:?}"
            ))),
        }
    }

    pub fn real(&self, index: usize) -> Result<f64> {
        match self.value(index)? {
            SqlValue::Real(f) => Ok(*f),
            SqlValue::Integer(n) => Ok(*n as f64),
            other => Err(RepositoryError::generic(format!(
                "column {index}: expected real, got {other:?}"
            ))),
        }
    }

    pub fn text(&self, index: usize) -> Result<&str> {
        match self.value(index)? {
            SqlValue::Text(s) => Ok(s),
            other => Err(RepositoryError::generic(format!(
                "column {index}: expected text, got {other:?}"
            ))),
        }
    }

    pub fn opt_text(&self, index: usize) -> Result<Option<&str>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s)),
            other => Err(RepositoryError::generic(format!(
                "column {index}: expected text or null, got {other:?}"
            ))),
        }
    }

    /// Booleans are stored as 0/1 integers.
    pub fn boolean(&self, index: usize) -> Result<bool> {
        Ok(self.integer(index)? != 0)
    }

    pub fn opt_boolean(&self, index: usize) -> Result<Option<bool>> {
        Ok(self.opt_integer(index)?.map(|n| n != 0))
    }
}

/// Capability contract a relational backend must implement.
///
/// Implementations are expected to create the persisted table layout when
/// they are opened, and to serialize access so that one logical statement at
/// a time executes per connection.
pub trait DatabaseAdapter {
    /// Run a statement that returns rows.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Run a statement that returns no rows; yields the affected row count.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    fn begin_transaction(&self) -> Result<()>;
    fn commit_transaction(&self) -> Result<()>;
    fn rollback_transaction(&self) -> Result<()>;

    fn begin_savepoint(&self, name: &str) -> Result<()>;
    fn release_savepoint(&self, name: &str) -> Result<()>;
    fn rollback_savepoint(&self, name: &str) -> Result<()>;

    /// Whether `error` is this backend's unique-constraint violation for the
    /// named constraint. Lets the engine translate backend errors into
    /// domain conflicts without parsing backend error text anywhere else.
    fn is_unique_violation(&self, error: &RepositoryError, constraint: &str) -> bool;

    /// Encode a raw cursor payload into an opaque caller-facing string.
    fn encode_cursor(&self, raw: &str) -> String;

    /// Decode an opaque cursor. Malformed input is a `BadRequest`.
    fn decode_cursor(&self, encoded: &str) -> Result<String>;

    /// First row of a query, or `None`.
    fn query_opt(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// First row of a query, or `NotFound`.
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<SqlRow> {
        self.query_opt(sql, params)?
            .ok_or_else(|| RepositoryError::not_found("query returned no rows"))
    }
}

/// Handle to an open root transaction. Nested scopes are savepoints created
/// through [`TransactionContext::with_nested`].
pub struct TransactionContext<'a, A: DatabaseAdapter> {
    adapter: &'a A,
    depth: Cell<u32>,
}

impl<'a, A: DatabaseAdapter> TransactionContext<'a, A> {
    pub fn adapter(&self) -> &A {
        self.adapter
    }

    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.adapter.query(sql, params)
    }

    pub fn query_opt(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        self.adapter.query_opt(sql, params)
    }

    pub fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<SqlRow> {
        self.adapter.query_one(sql, params)
    }

    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.adapter.execute(sql, params)
    }

    /// Run `f` inside a savepoint. On error only this scope rolls back; the
    /// enclosing transaction stays usable.
    pub fn with_nested<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        let name = format!("sp{depth}");
        self.adapter.begin_savepoint(&name)?;
        let result = f(self);
        self.depth.set(depth - 1);
        match result {
            Ok(value) => {
                self.adapter.release_savepoint(&name)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.adapter.rollback_savepoint(&name);
                Err(err)
            }
        }
    }
}

/// Run `f` inside a root transaction, committing on success and rolling back
/// on any error.
pub fn with_root_transaction<A, T, F>(adapter: &A, f: F) -> Result<T>
where
    A: DatabaseAdapter,
    F: FnOnce(&TransactionContext<'_, A>) -> Result<T>,
{
    adapter.begin_transaction()?;
    let ctx = TransactionContext {
        adapter,
        depth: Cell::new(0),
    };
    match f(&ctx) {
        Ok(value) => {
            adapter.commit_transaction()?;
            Ok(value)
        }
        Err(err) => {
            let _ = adapter.rollback_transaction();
            Err(err)
        }
    }
}
