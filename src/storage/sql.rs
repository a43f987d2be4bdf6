//! SQL parameter, row and cursor types shared by the relational and
//! time-series providers.

use std::fmt;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column, ColumnIndex, Decode, Postgres, Row as _, Type};

use crate::storage::{Context, StorageError};
use crate::storage::types::EngineType;

// =============================================================================
// Parameters
// =============================================================================

/// A positional SQL parameter (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Uuid(uuid::Uuid),
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_value_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    DateTime<Utc> => Timestamp,
    uuid::Uuid => Uuid,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Build a parameter list: `params![1, "name", None::<i64>]`.
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::storage::Value>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::storage::Value::from($value)),+]
    };
}

/// Bind parameters into sqlx arguments, in order.
pub(crate) fn bind_params(params: Vec<Value>) -> Result<PgArguments, StorageError> {
    let mut args = PgArguments::default();
    for (index, value) in params.into_iter().enumerate() {
        let result = match value {
            Value::Null => args.add(None::<String>),
            Value::Bool(v) => args.add(v),
            Value::Int(v) => args.add(v),
            Value::Float(v) => args.add(v),
            Value::Text(v) => args.add(v),
            Value::Bytes(v) => args.add(v),
            Value::Json(v) => args.add(v),
            Value::Timestamp(v) => args.add(v),
            Value::Uuid(v) => args.add(v),
        };
        result.map_err(|e| {
            StorageError::InvalidData(format!("cannot bind parameter ${}: {e}", index + 1))
        })?;
    }
    Ok(args)
}

// =============================================================================
// Rows
// =============================================================================

/// One result row.
pub struct Row {
    inner: PgRow,
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("columns", &self.columns())
            .finish()
    }
}

impl Row {
    pub(crate) fn new(inner: PgRow) -> Self {
        Self { inner }
    }

    /// Decode a column by position or name.
    pub fn get<'r, T, I>(&'r self, index: I) -> Result<T, StorageError>
    where
        T: Decode<'r, Postgres> + Type<Postgres>,
        I: ColumnIndex<PgRow> + fmt::Debug,
    {
        let label = format!("{index:?}");
        self.inner
            .try_get(index)
            .map_err(|e| StorageError::InvalidData(format!("column {label}: {e}")))
    }

    /// Column names in result order.
    pub fn columns(&self) -> Vec<&str> {
        self.inner.columns().iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The underlying sqlx row.
    pub fn into_inner(self) -> PgRow {
        self.inner
    }
}

pub(crate) type RowStream = Pin<Box<dyn Stream<Item = Result<PgRow, sqlx::Error>> + Send>>;

/// Forward-only cursor over a query result.
///
/// The first row is fetched when the cursor is opened, so statement errors
/// surface from the query call itself. Later errors surface from
/// [`Rows::next`], which honours the deadline of the context the query was
/// issued with. After [`Rows::close`] (or once exhausted) `next` returns
/// `Ok(None)`.
pub struct Rows {
    head: Option<PgRow>,
    stream: Option<RowStream>,
    ctx: Context,
}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows")
            .field("open", &!self.is_closed())
            .finish()
    }
}

impl Rows {
    /// Open a cursor, fetching the first row under `ctx`.
    pub(crate) async fn open(mut stream: RowStream, ctx: &Context) -> Result<Self, StorageError> {
        let head = ctx
            .run(async { stream.next().await.transpose() })
            .await?;
        let stream = head.is_some().then_some(stream);
        Ok(Self {
            head,
            stream,
            ctx: ctx.clone(),
        })
    }

    /// A cursor over rows already in memory.
    pub(crate) fn from_vec(rows: Vec<PgRow>) -> Self {
        let mut rows = rows.into_iter();
        let head = rows.next();
        let stream: Option<RowStream> = head
            .is_some()
            .then(|| Box::pin(futures::stream::iter(rows.map(Ok))) as RowStream);
        Self {
            head,
            stream,
            ctx: Context::background(),
        }
    }

    /// Advance to the next row.
    pub async fn next(&mut self) -> Result<Option<Row>, StorageError> {
        if let Some(row) = self.head.take() {
            return Ok(Some(Row::new(row)));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match self.ctx.run(async { stream.next().await.transpose() }).await {
            Ok(Some(row)) => Ok(Some(Row::new(row))),
            Ok(None) => {
                self.stream = None;
                Ok(None)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Drain the remaining rows.
    pub async fn collect(mut self) -> Result<Vec<Row>, StorageError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Release the cursor and its connection. Idempotent.
    pub fn close(&mut self) {
        self.head = None;
        self.stream = None;
    }

    pub fn is_closed(&self) -> bool {
        self.head.is_none() && self.stream.is_none()
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Always `None` on PostgreSQL; use `RETURNING` instead.
    pub last_insert_id: Option<i64>,
}

/// Map an empty `fetch_optional` into the not-found condition.
pub(crate) fn require_row(row: Option<PgRow>, engine: EngineType) -> Result<Row, StorageError> {
    row.map(Row::new)
        .ok_or_else(|| StorageError::NotFound(format!("{engine}: query returned no rows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_macro_conversions() {
        let params = crate::params![1_i32, "name", 2.5_f64, true, None::<i64>];
        assert_eq!(
            params,
            vec![
                Value::Int(1),
                Value::Text("name".to_string()),
                Value::Float(2.5),
                Value::Bool(true),
                Value::Null,
            ]
        );
        assert!(crate::params![].is_empty());
    }

    #[test]
    fn test_bind_params_counts() {
        let args = bind_params(crate::params![1_i64, "a", serde_json::json!({"k": 1})]).unwrap();
        assert_eq!(args.len(), 3);
    }

    #[tokio::test]
    async fn test_rows_close_is_idempotent() {
        let mut rows = Rows::from_vec(Vec::new());
        assert!(rows.is_closed());
        assert!(rows.next().await.unwrap().is_none());
        assert!(rows.is_closed());
        rows.close();
        rows.close();
        assert!(rows.next().await.unwrap().is_none());
    }

    #[test]
    fn test_require_row_not_found() {
        let err = require_row(None, EngineType::Relational).unwrap_err();
        assert!(err.is_not_found());
    }
}
