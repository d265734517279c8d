//! The metrics sink.
//!
//! Metrics are named numeric observations appended to the `metrics` table, each referencing exactly one run. A run may
//! carry several metrics with the same name, for example when a workload reported more than one timing line.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::{RunId, Store, StoreError};

/// A single named observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Name of the metric, e.g. `time.real_s`.
    pub name: String,
    /// Observed value.
    pub value: f64,
}

impl Metric {
    /// Creates a metric.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

pub(crate) fn insert_all(
    conn: &Connection,
    run_id: RunId,
    metrics: &[Metric],
) -> Result<(), StoreError> {
    let mut stmt =
        conn.prepare_cached("INSERT INTO metrics (run_id, name, value) VALUES (?1, ?2, ?3)")?;
    let run_id = run_id.to_string();
    for metric in metrics {
        stmt.execute(params![run_id, metric.name, metric.value])?;
    }
    Ok(())
}

/// Appends metrics to an existing run, all in one transaction.
///
/// The run must already have been registered through [`super::runs::create`]. Submitting no metrics does nothing and
/// does not touch the database. Returns the number of rows written.
///
/// # Errors
///
/// Returns a [`StoreError`] if the transaction fails, including when `run_id` does not reference a registered run.
pub async fn submit(
    store: &Store,
    run_id: RunId,
    metrics: Vec<Metric>,
) -> Result<usize, StoreError> {
    if metrics.is_empty() {
        log::debug!("[{run_id}] no metrics to submit");
        return Ok(0);
    }

    store
        .with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_all(&tx, run_id, &metrics)?;
            tx.commit()?;
            log::debug!("[{run_id}] submitted {} metrics", metrics.len());
            Ok(metrics.len())
        })
        .await
}

/// Fetches the metrics of a run in submission order.
///
/// # Errors
///
/// Returns a [`StoreError`] if the query fails.
pub async fn for_run(store: &Store, run_id: RunId) -> Result<Vec<Metric>, StoreError> {
    store
        .with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, value FROM metrics WHERE run_id = ?1 ORDER BY metric_id",
            )?;
            let metrics = stmt
                .query_map(params![run_id.to_string()], |row| {
                    Ok(Metric {
                        name: row.get(0)?,
                        value: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(metrics)
        })
        .await
}
