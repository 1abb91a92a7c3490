use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use unit_of_work_engine::{
    ConnectionPool, Context, DbError, DbTx, ExecResult, Row, Statement, TxHandle, TxOptions, Value,
};

type Table = BTreeMap<String, String>;

/// Counters shared by a pool and every transaction it hands out.
#[derive(Debug, Default)]
pub struct Stats {
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    begin: bool,
    commit: bool,
    commit_stays_open: bool,
    rollback: bool,
}

/// In-memory stand-in for a connection pool over a single key/value table.
///
/// Understands three statements: `INSERT` (args: key, value), `SELECT COUNT`
/// and `SELECT` (optional arg: key). Writes made in a transaction stay private
/// until commit.
#[derive(Debug, Default)]
pub struct MemoryPool {
    table: Arc<Mutex<Table>>,
    stats: Arc<Stats>,
    faults: Mutex<Faults>,
    last_options: Mutex<Option<TxOptions>>,
}

impl MemoryPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_begin(&self) {
        self.faults.lock().begin = true;
    }

    /// Commits fail and, like most drivers, leave the transaction finished.
    pub fn fail_commit(&self) {
        self.faults.lock().commit = true;
    }

    /// Commits fail and leave the transaction active, so the cleanup rollback
    /// really runs.
    pub fn fail_commit_staying_open(&self) {
        self.faults.lock().commit_stays_open = true;
    }

    pub fn fail_rollback(&self) {
        self.faults.lock().rollback = true;
    }

    pub fn begins(&self) -> usize {
        self.stats.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.stats.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.stats.rollbacks.load(Ordering::SeqCst)
    }

    /// Number of committed rows.
    pub fn committed_len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn committed(&self, key: &str) -> Option<String> {
        self.table.lock().get(key).cloned()
    }

    pub fn last_options(&self) -> Option<TxOptions> {
        *self.last_options.lock()
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Tx = MemoryTx;

    async fn begin(&self, ctx: &Context, options: &TxOptions) -> Result<MemoryTx, DbError> {
        ctx.check()?;
        let faults = *self.faults.lock();
        if faults.begin {
            return Err(DbError::Backend("too many connections".into()));
        }
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(*options);
        Ok(MemoryTx {
            table: Arc::clone(&self.table),
            stats: Arc::clone(&self.stats),
            staged: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            read_only: options.is_read_only(),
            faults,
        })
    }
}

/// Autocommit access straight to the table.
#[async_trait]
impl DbTx for MemoryPool {
    async fn prepare(&self, ctx: &Context, query: &str) -> Result<Statement, DbError> {
        ctx.check()?;
        prepare(query)
    }

    async fn query_one(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Row, DbError> {
        let mut rows = self.query_many(ctx, query, args).await?;
        if rows.is_empty() {
            return Err(DbError::NoRows);
        }
        Ok(rows.swap_remove(0))
    }

    async fn query_many(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        ctx.check()?;
        let table = self.table.lock();
        select(&table, query, args)
    }

    async fn execute(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DbError> {
        ctx.check()?;
        let mut table = self.table.lock();
        let (key, value) = insert(&table, false, query, args)?;
        table.insert(key, value);
        Ok(ExecResult { rows_affected: 1 })
    }
}

#[derive(Debug)]
pub struct MemoryTx {
    table: Arc<Mutex<Table>>,
    stats: Arc<Stats>,
    staged: Mutex<Vec<(String, String)>>,
    finished: AtomicBool,
    read_only: bool,
    faults: Faults,
}

impl MemoryTx {
    fn view(&self) -> Result<Table, DbError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        let mut view = self.table.lock().clone();
        view.extend(self.staged.lock().iter().cloned());
        Ok(view)
    }
}

#[async_trait]
impl DbTx for MemoryTx {
    async fn prepare(&self, ctx: &Context, query: &str) -> Result<Statement, DbError> {
        ctx.check()?;
        self.view()?;
        prepare(query)
    }

    async fn query_one(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Row, DbError> {
        let mut rows = self.query_many(ctx, query, args).await?;
        if rows.is_empty() {
            return Err(DbError::NoRows);
        }
        Ok(rows.swap_remove(0))
    }

    async fn query_many(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        ctx.check()?;
        select(&self.view()?, query, args)
    }

    async fn execute(
        &self,
        ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DbError> {
        ctx.check()?;
        let entry = insert(&self.view()?, self.read_only, query, args)?;
        self.staged.lock().push(entry);
        Ok(ExecResult { rows_affected: 1 })
    }
}

#[async_trait]
impl TxHandle for MemoryTx {
    async fn commit(&self) -> Result<(), DbError> {
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        if self.finished.load(Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        if self.faults.commit_stays_open {
            return Err(DbError::Backend("deferred constraint violated".into()));
        }
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        if self.faults.commit {
            return Err(DbError::Backend("could not serialize access".into()));
        }
        let staged = std::mem::take(&mut *self.staged.lock());
        self.table.lock().extend(staged);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        self.staged.lock().clear();
        if self.faults.rollback {
            return Err(DbError::Backend("connection reset by peer".into()));
        }
        Ok(())
    }
}

fn prepare(query: &str) -> Result<Statement, DbError> {
    let columns = if query.starts_with("SELECT COUNT") {
        vec!["count".to_owned()]
    } else if query.starts_with("SELECT") {
        vec!["key".to_owned(), "value".to_owned()]
    } else if query.starts_with("INSERT") {
        Vec::new()
    } else {
        return Err(DbError::Backend(format!("syntax error: {query}")));
    };
    Ok(Statement {
        sql: query.to_owned(),
        columns,
    })
}

fn select(table: &Table, query: &str, args: &[Value]) -> Result<Vec<Row>, DbError> {
    if query.starts_with("SELECT COUNT") {
        let count = Value::Int(table.len() as i64);
        return Ok(vec![Row::new(vec!["count".into()], vec![count])]);
    }
    if !query.starts_with("SELECT") {
        return Err(DbError::Backend(format!("syntax error: {query}")));
    }
    let wanted = args.first().and_then(Value::as_str);
    Ok(table
        .iter()
        .filter(|(key, _)| wanted.map_or(true, |wanted| wanted == key.as_str()))
        .map(|(key, value)| {
            Row::new(
                vec!["key".into(), "value".into()],
                vec![key.as_str().into(), value.as_str().into()],
            )
        })
        .collect())
}

fn insert(
    table: &Table,
    read_only: bool,
    query: &str,
    args: &[Value],
) -> Result<(String, String), DbError> {
    if !query.starts_with("INSERT") {
        return Err(DbError::Backend(format!("syntax error: {query}")));
    }
    if read_only {
        return Err(DbError::Backend(
            "cannot execute INSERT in a read-only transaction".into(),
        ));
    }
    let (Some(key), Some(value)) = (
        args.first().and_then(Value::as_str),
        args.get(1).and_then(Value::as_str),
    ) else {
        return Err(DbError::Backend("INSERT expects (key, value)".into()));
    };
    if table.contains_key(key) {
        return Err(DbError::Backend(format!("duplicate key: {key}")));
    }
    Ok((key.to_owned(), value.to_owned()))
}
