use std::error::Error as StdError;

use crate::ContextError;

/// Error type for capability-handle and pool operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("operation aborted: {0}")]
    Cancelled(#[from] ContextError),

    #[error("transaction has already been committed or rolled back")]
    TxDone,

    #[error("query returned no rows")]
    NoRows,

    #[error("unsupported column type {type_name} for column {column}")]
    UnsupportedType { column: String, type_name: String },

    #[error("database error: {0}")]
    Driver(#[from] sqlx::Error),

    /// Failure reported by a non-sqlx backend.
    #[error("database error: {0}")]
    Backend(String),
}

impl DbError {
    /// The one rollback failure treated as benign: the driver already resolved
    /// the transaction.
    pub fn is_tx_done(&self) -> bool {
        matches!(self, DbError::TxDone)
    }
}

/// Error returned by [`UnitOfWork::run`](crate::UnitOfWork::run).
///
/// `Ok` from `run` means the transaction committed. Every variant here means
/// nothing was persisted, except `Commit`, where the transaction outcome is
/// whatever the driver made of the failed commit.
#[derive(Debug, thiserror::Error)]
pub enum UowError<E>
where
    E: StdError + 'static,
{
    /// The context was already done; no transaction was begun.
    #[error("context done before transaction began: {0}")]
    Cancelled(#[source] ContextError),

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] DbError),

    /// The work returned an error and the transaction was rolled back.
    #[error("unit of work failed: {source}{}", rollback_note(.rollback))]
    Work {
        source: E,
        rollback: Option<DbError>,
    },

    /// The work succeeded but the context was done before commit.
    #[error("context cancelled during transaction: {source}{}", rollback_note(.rollback))]
    CancelledDuringTransaction {
        source: ContextError,
        rollback: Option<DbError>,
    },

    #[error("failed to commit transaction: {source}{}", rollback_note(.rollback))]
    Commit {
        source: DbError,
        rollback: Option<DbError>,
    },
}

fn rollback_note(rollback: &Option<DbError>) -> String {
    match rollback {
        Some(err) => format!(" (rollback also failed: {err})"),
        None => String::new(),
    }
}

impl<E> UowError<E>
where
    E: StdError + 'static,
{
    /// The error returned by the caller's work, if that is what failed.
    pub fn work_error(&self) -> Option<&E> {
        match self {
            UowError::Work { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn into_work_error(self) -> Option<E> {
        match self {
            UowError::Work { source, .. } => Some(source),
            _ => None,
        }
    }

    /// A non-benign failure of the rollback that followed the primary error.
    pub fn rollback_error(&self) -> Option<&DbError> {
        match self {
            UowError::Work { rollback, .. }
            | UowError::CancelledDuringTransaction { rollback, .. }
            | UowError::Commit { rollback, .. } => rollback.as_ref(),
            _ => None,
        }
    }

    /// The context error anywhere in the cause chain, including one the work
    /// itself returned.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            UowError::Cancelled(err) => Some(*err),
            UowError::CancelledDuringTransaction { source, .. } => Some(*source),
            UowError::Begin(source) | UowError::Commit { source, .. } => find_context_error(source),
            UowError::Work { source, .. } => find_context_error(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.context_error().is_some()
    }
}

fn find_context_error(err: &(dyn StdError + 'static)) -> Option<ContextError> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(ctx_err) = err.downcast_ref::<ContextError>() {
            return Some(*ctx_err);
        }
        current = err.source();
    }
    None
}
