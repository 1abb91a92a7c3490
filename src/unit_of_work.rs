use std::any::Any;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::{ConnectionPool, Context, DbError, DbTx, TxHandle, TxOptions, UowError};

/// Unit of Work engine for running caller logic in one database transaction.
///
/// The engine holds only the shared pool and immutable options, so any number
/// of concurrent [`run`](Self::run) calls may share one instance; each call
/// begins, owns and resolves its own transaction.
#[derive(Debug)]
pub struct UnitOfWork<P> {
    pool: Arc<P>,
    options: TxOptions,
}

impl<P> Clone for UnitOfWork<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            options: self.options,
        }
    }
}

impl<P: ConnectionPool> UnitOfWork<P> {
    /// Create a UnitOfWork that uses the server's default transaction options.
    pub fn new(pool: Arc<P>) -> Self {
        Self::with_options(pool, TxOptions::default())
    }

    /// Create a UnitOfWork whose transactions all use `options`.
    pub fn with_options(pool: Arc<P>, options: TxOptions) -> Self {
        Self { pool, options }
    }

    pub fn options(&self) -> &TxOptions {
        &self.options
    }

    /// The shared pool, for data access outside a unit of work.
    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Run `work` inside a new transaction.
    ///
    /// The transaction commits only when `work` returns `Ok` and `ctx` is
    /// still valid afterwards; otherwise it is rolled back. `ctx` is checked
    /// before beginning and again before committing, not while `work` or the
    /// commit is in flight. A panic inside `work` rolls the transaction back
    /// and is then resumed.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            isolation = %self.options.isolation_level(),
            read_only = self.options.is_read_only(),
        )
    )]
    pub async fn run<T, E, F>(&self, ctx: &Context, work: F) -> Result<T, UowError<E>>
    where
        F: for<'a> FnOnce(&'a Context, &'a dyn DbTx) -> BoxFuture<'a, Result<T, E>> + Send,
        T: Send,
        E: StdError + Send + 'static,
    {
        if let Err(err) = ctx.check() {
            debug!(error = %err, "context done before begin");
            return Err(UowError::Cancelled(err));
        }

        let tx = self
            .pool
            .begin(ctx, &self.options)
            .await
            .map_err(UowError::Begin)?;
        debug!("transaction started");

        // Calling `work` inside the guarded future also catches panics raised
        // before it hands back its future.
        let outcome = AssertUnwindSafe(async { work(ctx, &tx).await })
            .catch_unwind()
            .await;

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => {
                debug!(error = %source, "work failed, rolling back");
                let rollback = rollback_tx(&tx).await;
                return Err(UowError::Work { source, rollback });
            }
            Err(payload) => {
                warn!("work panicked, rolling back");
                let payload = match rollback_tx(&tx).await {
                    Some(err) => annotate_panic(payload, &err),
                    None => payload,
                };
                panic::resume_unwind(payload);
            }
        };

        // The commit call does not observe `ctx`, so this is the last point
        // at which cancellation can still prevent it.
        if let Err(source) = ctx.check() {
            debug!(error = %source, "context done during transaction, rolling back");
            let rollback = rollback_tx(&tx).await;
            return Err(UowError::CancelledDuringTransaction { source, rollback });
        }

        if let Err(source) = tx.commit().await {
            warn!(error = %source, "commit failed");
            let rollback = rollback_tx(&tx).await;
            return Err(UowError::Commit { source, rollback });
        }
        debug!("transaction committed");

        Ok(value)
    }
}

/// Roll `tx` back, returning the failure unless it is the benign
/// "already finished" case.
async fn rollback_tx<X: TxHandle>(tx: &X) -> Option<DbError> {
    match tx.rollback().await {
        Ok(()) => {
            debug!("transaction rolled back");
            None
        }
        Err(err) if err.is_tx_done() => {
            debug!("transaction already finished");
            None
        }
        Err(err) => {
            warn!(error = %err, "rollback failed");
            Some(err)
        }
    }
}

/// Append the rollback failure to a `String` panic message. Payloads of any
/// other type, `&'static str` included, keep their type and are resumed
/// untouched; the failure is logged instead.
fn annotate_panic(mut payload: Box<dyn Any + Send>, rollback: &DbError) -> Box<dyn Any + Send> {
    match payload.downcast_mut::<String>() {
        Some(message) => message.push_str(&format!(" (rollback also failed: {rollback})")),
        None => error!(error = %rollback, "rollback after panic failed"),
    }
    payload
}
