use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, Statement as _, Transaction, TypeInfo};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    ConnectionPool, Context, DbError, DbTx, ExecResult, Kind, Row, Statement, TxHandle, TxOptions,
    Value,
};

/// PgTx wraps a PostgreSQL transaction for use by caller work.
///
/// The transaction sits behind a mutex so the handle can be shared as
/// `&dyn DbTx`; commit and rollback take it out, after which every call
/// reports [`DbError::TxDone`].
#[derive(Debug)]
pub struct PgTx {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgTx {
    /// Creates a new PgTx from a PostgreSQL transaction.
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Takes ownership of the transaction, leaving None in its place.
    async fn take_transaction(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        self.tx.lock().await.take().ok_or(DbError::TxDone)
    }
}

#[async_trait]
impl DbTx for PgTx {
    async fn prepare(&self, ctx: &Context, query: &str) -> Result<Statement, DbError> {
        ctx.check()?;
        let mut tx_guard = self.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(DbError::TxDone)?;
        prepare_on(&mut **tx, query).await
    }

    async fn query_one(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Row, DbError> {
        ctx.check()?;
        let mut tx_guard = self.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(DbError::TxDone)?;
        query_one_on(&mut **tx, query, args).await
    }

    async fn query_many(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        ctx.check()?;
        let mut tx_guard = self.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(DbError::TxDone)?;
        query_many_on(&mut **tx, query, args).await
    }

    async fn execute(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DbError> {
        ctx.check()?;
        let mut tx_guard = self.tx.lock().await;
        let tx = tx_guard.as_mut().ok_or(DbError::TxDone)?;
        execute_on(&mut **tx, query, args).await
    }
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(&self) -> Result<(), DbError> {
        let tx = self.take_transaction().await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        let tx = self.take_transaction().await?;
        tx.rollback().await?;
        Ok(())
    }
}

/// Pooled-connection variant: each call runs on whichever connection the
/// pool hands out, outside any transaction.
#[async_trait]
impl DbTx for PgPool {
    async fn prepare(&self, ctx: &Context, query: &str) -> Result<Statement, DbError> {
        ctx.check()?;
        prepare_on(self, query).await
    }

    async fn query_one(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Row, DbError> {
        ctx.check()?;
        query_one_on(self, query, args).await
    }

    async fn query_many(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        ctx.check()?;
        query_many_on(self, query, args).await
    }

    async fn execute(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DbError> {
        ctx.check()?;
        execute_on(self, query, args).await
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    type Tx = PgTx;

    async fn begin(&self, ctx: &Context, options: &TxOptions) -> Result<PgTx, DbError> {
        ctx.check()?;
        let mut tx = sqlx::Pool::begin(self).await?;
        if let Some(sql) = options.set_transaction_sql() {
            // Dropping `tx` on failure rolls it back.
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        Ok(PgTx::new(tx))
    }
}

fn bind_args<'q>(query: &'q str, args: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(query), |query, arg| match arg {
        Value::Null(Kind::Bool) => query.bind(None::<bool>),
        Value::Null(Kind::Int) => query.bind(None::<i64>),
        Value::Null(Kind::Float) => query.bind(None::<f64>),
        Value::Null(Kind::Text) => query.bind(None::<String>),
        Value::Null(Kind::Bytes) => query.bind(None::<Vec<u8>>),
        Value::Null(Kind::Uuid) => query.bind(None::<Uuid>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
        Value::Uuid(v) => query.bind(*v),
    })
}

async fn prepare_on<'c, X>(executor: X, query: &str) -> Result<Statement, DbError>
where
    X: sqlx::Executor<'c, Database = Postgres>,
{
    let statement = executor.prepare(query).await?;
    Ok(Statement {
        sql: query.to_owned(),
        columns: statement
            .columns()
            .iter()
            .map(|column| column.name().to_owned())
            .collect(),
    })
}

async fn query_one_on<'c, X>(executor: X, query: &str, args: &[Value]) -> Result<Row, DbError>
where
    X: sqlx::Executor<'c, Database = Postgres>,
{
    let row = bind_args(query, args).fetch_optional(executor).await?;
    match row {
        Some(row) => decode_row(&row),
        None => Err(DbError::NoRows),
    }
}

async fn query_many_on<'c, X>(executor: X, query: &str, args: &[Value]) -> Result<Vec<Row>, DbError>
where
    X: sqlx::Executor<'c, Database = Postgres>,
{
    let rows = bind_args(query, args).fetch_all(executor).await?;
    rows.iter().map(decode_row).collect()
}

async fn execute_on<'c, X>(executor: X, query: &str, args: &[Value]) -> Result<ExecResult, DbError>
where
    X: sqlx::Executor<'c, Database = Postgres>,
{
    let done = bind_args(query, args).execute(executor).await?;
    Ok(ExecResult {
        rows_affected: done.rows_affected(),
    })
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for column in row.columns() {
        let idx = column.ordinal();
        let (kind, value) = match column.type_info().name() {
            "BOOL" => (Kind::Bool, row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool)),
            "INT2" => (
                Kind::Int,
                row.try_get::<Option<i16>, _>(idx)?
                    .map(|v| Value::Int(v.into())),
            ),
            "INT4" => (
                Kind::Int,
                row.try_get::<Option<i32>, _>(idx)?
                    .map(|v| Value::Int(v.into())),
            ),
            "INT8" => (Kind::Int, row.try_get::<Option<i64>, _>(idx)?.map(Value::Int)),
            "FLOAT4" => (
                Kind::Float,
                row.try_get::<Option<f32>, _>(idx)?
                    .map(|v| Value::Float(v.into())),
            ),
            "FLOAT8" => (Kind::Float, row.try_get::<Option<f64>, _>(idx)?.map(Value::Float)),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => (
                Kind::Text,
                row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
            ),
            "BYTEA" => (
                Kind::Bytes,
                row.try_get::<Option<Vec<u8>>, _>(idx)?.map(Value::Bytes),
            ),
            "UUID" => (Kind::Uuid, row.try_get::<Option<Uuid>, _>(idx)?.map(Value::Uuid)),
            other => {
                return Err(DbError::UnsupportedType {
                    column: column.name().to_owned(),
                    type_name: other.to_owned(),
                })
            }
        };
        let value = value.unwrap_or(Value::Null(kind));
        columns.push(column.name().to_owned());
        values.push(value);
    }

    Ok(Row::new(columns, values))
}
