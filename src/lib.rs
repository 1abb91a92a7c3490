//! Transactional Unit of Work engine
//!
//! Wraps a block of caller data-access logic in a single database transaction and
//! guarantees the transaction is committed or rolled back exactly once, whether the
//! work returns an error, the caller's context is cancelled, or the work panics.
//! Caller code is written against [`DbTx`], which both a pooled connection and a
//! live transaction implement.

pub mod context;
pub mod dbtx;
pub mod error;
pub mod executor;
pub mod options;
pub mod unit_of_work;
pub mod value;

pub use context::{Context, ContextError};
pub use dbtx::{ConnectionPool, DbTx, TxHandle};
pub use error::{DbError, UowError};
pub use executor::PgTx;
pub use options::{IsolationLevel, ParseIsolationLevelError, TxOptions};
pub use unit_of_work::UnitOfWork;
pub use value::{ExecResult, Kind, Row, Statement, Typed, Value};
