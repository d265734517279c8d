//! The run registry.
//!
//! Every execution of a project under an experiment gets its own row in the `runs` table, identified by a freshly
//! generated [`RunId`]. Identifiers are random (UUID v4), so any number of harness processes can register runs against
//! the same datastore without coordinating.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Store, StoreError};

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_identifier!(
    /// Unique identifier of a run.
    RunId
);

uuid_identifier!(
    /// Identifier tying together the runs of one trial (for example all workloads of a project at one job count).
    RunGroup
);

/// A run that has not been registered yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRun {
    /// Rendering of the measured command.
    pub command: String,
    /// Name of the project that was run.
    pub project: String,
    /// Name of the experiment the project was run under.
    pub experiment: String,
    /// Group this run belongs to.
    pub run_group: RunGroup,
}

impl NewRun {
    /// Describes a run of `command` for `project` under `experiment`.
    pub fn new(
        command: impl Into<String>,
        project: impl Into<String>,
        experiment: impl Into<String>,
        run_group: RunGroup,
    ) -> Self {
        Self {
            command: command.into(),
            project: project.into(),
            experiment: experiment.into(),
            run_group,
        }
    }
}

/// A registered run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier of this run.
    pub id: RunId,
    /// Name of the project that was run.
    pub project: String,
    /// Name of the experiment the project was run under.
    pub experiment: String,
    /// Group this run belongs to.
    pub run_group: RunGroup,
    /// Rendering of the measured command.
    pub command: String,
    /// When the run was registered.
    pub created_at: DateTime<Utc>,
}

/// Inserts a run row on an existing connection or transaction and returns its new identifier.
pub(crate) fn insert(conn: &Connection, run: &NewRun) -> Result<RunId, StoreError> {
    let id = RunId::generate();
    conn.execute(
        "INSERT INTO runs (run_id, project, experiment, run_group, command, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            run.project,
            run.experiment,
            run.run_group.to_string(),
            run.command,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

/// Registers a new run and returns its freshly allocated identifier.
///
/// # Errors
///
/// Returns a [`StoreError`] if the row cannot be committed. Callers must not submit metrics for a run that failed to
/// register.
pub async fn create(
    store: &Store,
    command: impl Into<String>,
    project: impl Into<String>,
    experiment: impl Into<String>,
    run_group: RunGroup,
) -> Result<RunId, StoreError> {
    let run = NewRun::new(command, project, experiment, run_group);
    store
        .with_conn(move |conn| {
            let id = insert(conn, &run)?;
            log::debug!("[{id}] registered run of {} ({})", run.project, run.experiment);
            Ok(id)
        })
        .await
}

type RawRun = (String, String, String, String, String, String);

const SELECT_RUNS: &str =
    "SELECT run_id, project, experiment, run_group, command, created_at FROM runs";

fn raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(
    (id, project, experiment, run_group, command, created_at): RawRun,
) -> Result<Run, StoreError> {
    Ok(Run {
        id: id
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("run_id {id:?}: {err}")))?,
        project,
        experiment,
        run_group: run_group
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("run_group {run_group:?}: {err}")))?,
        command,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|err| StoreError::Corrupt(format!("created_at {created_at:?}: {err}")))?
            .with_timezone(&Utc),
    })
}

/// Fetches a single run.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if no such run exists.
pub async fn get(store: &Store, id: RunId) -> Result<Run, StoreError> {
    store
        .with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("{SELECT_RUNS} WHERE run_id = ?1"),
                    params![id.to_string()],
                    raw_run,
                )
                .optional()?
                .ok_or(StoreError::NotFound(id))?;
            decode(raw)
        })
        .await
}

/// Lists every run belonging to the given group, oldest first.
///
/// # Errors
///
/// Returns a [`StoreError`] if the query fails.
pub async fn in_group(store: &Store, run_group: RunGroup) -> Result<Vec<Run>, StoreError> {
    store
        .with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_RUNS} WHERE run_group = ?1 ORDER BY created_at, rowid"
            ))?;
            let raws = stmt
                .query_map(params![run_group.to_string()], raw_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(decode).collect()
        })
        .await
}

/// Lists every registered run, oldest first.
///
/// # Errors
///
/// Returns a [`StoreError`] if the query fails.
pub async fn list(store: &Store) -> Result<Vec<Run>, StoreError> {
    store
        .with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_RUNS} ORDER BY created_at, rowid"))?;
            let raws = stmt
                .query_map([], raw_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(decode).collect()
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn created_runs_can_be_read_back() {
        let store = Store::open_in_memory().unwrap();
        let group = RunGroup::generate();

        let id = create(&store, "/usr/bin/time ./linpack", "linpack", "polly-openmp", group)
            .await
            .unwrap();
        let run = get(&store, id).await.unwrap();

        assert_eq!(run.id, id);
        assert_eq!(run.project, "linpack");
        assert_eq!(run.experiment, "polly-openmp");
        assert_eq!(run.run_group, group);
        assert_eq!(run.command, "/usr/bin/time ./linpack");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let store = Store::open_in_memory().unwrap();

        let err = get(&store, RunId::generate()).await.unwrap_err();

        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn runs_are_filtered_by_group() {
        let store = Store::open_in_memory().unwrap();
        let (a, b) = (RunGroup::generate(), RunGroup::generate());

        for group in [a, a, b] {
            create(&store, "cmd", "p", "e", group).await.unwrap();
        }

        assert_eq!(in_group(&store, a).await.unwrap().len(), 2);
        assert_eq!(in_group(&store, b).await.unwrap().len(), 1);
        assert_eq!(list(&store).await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_never_collides() {
        let store = Store::open_in_memory().unwrap();
        let group = RunGroup::generate();

        let ids = futures::future::join_all((0..1000).map(|i| {
            let store = store.clone();
            async move {
                create(&store, format!("workload {i}"), "p", "e", group)
                    .await
                    .unwrap()
            }
        }))
        .await;

        let distinct: HashSet<RunId> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 1000);
        assert_eq!(list(&store).await.unwrap().len(), 1000);
    }

    #[test]
    fn identifiers_round_trip_through_strings() {
        let id = RunId::generate();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
        assert!("not-a-uuid".parse::<RunGroup>().is_err());
    }
}
