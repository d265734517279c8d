//! SQLite-backed datastore for runs and their metrics.
//!
//! The store holds two append-only tables:
//!
//! - `runs` (`run_id` PK, `project`, `experiment`, `run_group`, `command`, `created_at`), written by the run registry
//!   in [`runs`].
//! - `metrics` (`metric_id` PK, `run_id` FK, `name`, `value`), written by the metrics sink in [`metrics`].
//!
//! Rows are only ever inserted. Every write happens in its own transaction, and foreign keys are enforced so a metric
//! can never reference a run that does not exist.
//!
//! # Examples
//!
//! ```no_run
//! use polly_bench::store::{self, metrics::Metric, runs, RunGroup, Store};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = Store::open("results/polly-bench.sqlite")?;
//! let run_id = runs::create(&store, "./linpack", "linpack", "polly-openmp", RunGroup::generate()).await?;
//! store::metrics::submit(&store, run_id, vec![Metric::new("time.real_s", 1.3)]).await?;
//! #     Ok(())
//! # }
//! ```

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use rusqlite::Connection;

pub mod metrics;
pub mod runs;

pub use runs::{NewRun, Run, RunGroup, RunId};

use metrics::Metric;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS runs (\
    run_id TEXT PRIMARY KEY NOT NULL,\
    project TEXT NOT NULL,\
    experiment TEXT NOT NULL,\
    run_group TEXT NOT NULL,\
    command TEXT NOT NULL,\
    created_at TEXT NOT NULL\
);\
CREATE TABLE IF NOT EXISTS metrics (\
    metric_id INTEGER PRIMARY KEY AUTOINCREMENT,\
    run_id TEXT NOT NULL REFERENCES runs(run_id),\
    name TEXT NOT NULL,\
    value REAL NOT NULL\
);\
CREATE INDEX IF NOT EXISTS idx_runs_run_group ON runs(run_group);\
CREATE INDEX IF NOT EXISTS idx_metrics_run_id ON metrics(run_id);";

/// Failures of the datastore. Any of these means results can no longer be recorded.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database could not be opened or initialized.
    #[error("could not open datastore at {}: {source}", .path.display())]
    Open {
        /// Location of the database.
        path: PathBuf,
        /// Underlying SQLite error.
        source: rusqlite::Error,
    },
    /// A statement or transaction was rejected.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The database directory could not be created.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The blocking task running the query died.
    #[error("datastore task failed: {0}")]
    Join(String),
    /// No run with the given identifier exists.
    #[error("run {0} not found")]
    NotFound(RunId),
    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Shared handle to the datastore.
///
/// Cloning is cheap; all clones share one connection, and queries run on the blocking thread pool.
#[derive(Clone, Debug)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the database at the given path and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the parent directory cannot be created and [`StoreError::Open`] if the database
    /// cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        log::debug!("opening datastore at {}...", path.display());
        let conn = Connection::open(path)
            .and_then(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL;\
                     PRAGMA synchronous=NORMAL;\
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok(conn)
            })
            .and_then(Self::initialize)
            .map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!("opened datastore at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens a private in-memory database, mostly useful for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if SQLite cannot create the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .and_then(Self::initialize)
            .map_err(|source| StoreError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize(conn: Connection) -> rusqlite::Result<Connection> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // A panic in another query does not leave the connection itself unusable.
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Join(err.to_string()))?
    }
}

/// Creates a run and all of its metrics in a single transaction.
///
/// Either the run row and every metric row are committed, or nothing is. This is what the pipeline uses, so a crash
/// between registering a run and submitting its metrics cannot leave a run behind without its measurements.
///
/// # Errors
///
/// Returns a [`StoreError`] if the transaction cannot be committed.
pub async fn record(
    store: &Store,
    run: NewRun,
    metrics: Vec<Metric>,
) -> Result<RunId, StoreError> {
    store
        .with_conn(move |conn| {
            let tx = conn.transaction()?;
            let run_id = runs::insert(&tx, &run)?;
            metrics::insert_all(&tx, run_id, &metrics)?;
            tx.commit()?;
            log::debug!(
                "[{run_id}] recorded run of {} ({}) with {} metrics",
                run.project,
                run.experiment,
                metrics.len()
            );
            Ok(run_id)
        })
        .await
}
