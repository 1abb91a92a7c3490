use async_trait::async_trait;

use crate::{Context, DbError, ExecResult, Row, Statement, TxOptions, Value};

/// Data-access surface shared by a pooled connection and a live transaction.
///
/// Code written against `DbTx` runs unchanged inside or outside a unit of
/// work. Every method fails with [`DbError::Cancelled`] without touching the
/// database when `ctx` is already done. None of them commit or roll back.
#[async_trait]
pub trait DbTx: Send + Sync {
    async fn prepare(&self, ctx: &Context, query: &str) -> Result<Statement, DbError>;

    /// Fetch exactly one row; [`DbError::NoRows`] when the query yields none.
    async fn query_one(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Row, DbError>;

    async fn query_many(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, DbError>;

    async fn execute(&self, ctx: &Context, query: &str, args: &[Value])
        -> Result<ExecResult, DbError>;
}

/// A live transaction.
///
/// Resolution takes `&self` so that a cleanup rollback can follow a failed
/// commit. Once either call has taken the transaction, further calls fail
/// with [`DbError::TxDone`].
#[async_trait]
pub trait TxHandle: DbTx {
    async fn commit(&self) -> Result<(), DbError>;

    async fn rollback(&self) -> Result<(), DbError>;
}

/// Source of transactions, shared by every unit of work built on it.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    type Tx: TxHandle;

    /// Begin a transaction with `options` applied before any caller statement.
    async fn begin(&self, ctx: &Context, options: &TxOptions) -> Result<Self::Tx, DbError>;
}
