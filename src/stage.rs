//! Nested, timed stages for structured logging.
//!
//! The pipeline wraps each of its phases in a [`Stage`]. Entering a stage logs a line, and dropping the guard logs the
//! matching exit with the elapsed wall time, whether the stage body returned normally, bailed out early with `?`, or
//! panicked. Stages nest: a stage entered while another is open is rendered as `outer > inner`.
//!
//! # Examples
//!
//! ```
//! use polly_bench::stage::StageTracker;
//!
//! let tracker = StageTracker::new();
//! {
//!     let step = tracker.enter("polly-openmp: linpack");
//!     let substep = tracker.enter("build");
//!     substep.succeed();
//!     step.fail("workload crashed");
//! }
//!
//! assert_eq!(tracker.balance(), (2, 2));
//! ```

use std::{
    fmt::Display,
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

const SEPARATOR: &str = " > ";

/// How a stage ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum StageOutcome {
    /// The stage body completed.
    Succeeded,
    /// The stage body failed, with a human readable reason.
    Failed(String),
}

/// One entry of the stage journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum StageEvent {
    /// A stage was entered.
    Entered {
        /// Full `outer > inner` path of the stage.
        path: String,
    },
    /// A stage was exited.
    Exited {
        /// Full `outer > inner` path of the stage.
        path: String,
        /// Wall time spent inside the stage.
        elapsed: Duration,
        /// How the stage ended.
        outcome: StageOutcome,
    },
}

#[derive(Debug, Default)]
struct State {
    stack: Vec<String>,
    journal: Vec<StageEvent>,
}

/// Keeps the stack of open stages and a journal of everything that was entered and exited.
#[derive(Debug, Default)]
pub struct StageTracker {
    state: Mutex<State>,
}

impl StageTracker {
    /// Creates a tracker with no open stages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // The state stays consistent even if a holder panicked; no code panics while
        // holding the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a stage nested inside whatever stage is currently open.
    ///
    /// The stage stays open until the returned guard is dropped.
    pub fn enter(&self, label: impl Into<String>) -> Stage<'_> {
        let label = label.into();
        let (path, depth) = {
            let mut state = self.state();
            let depth = state.stack.len();
            state.stack.push(label);
            let path = state.stack.join(SEPARATOR);
            state.journal.push(StageEvent::Entered { path: path.clone() });
            (path, depth)
        };
        log::info!("[{path}] starting...");

        Stage {
            tracker: self,
            path,
            depth,
            start: Instant::now(),
            outcome: None,
        }
    }

    fn exit(&self, path: &str, depth: usize, elapsed: Duration, outcome: StageOutcome) {
        {
            let mut state = self.state();
            if state.stack.len() != depth + 1 {
                log::warn!(
                    "[{path}] closed while {} inner stage(s) were still open",
                    state.stack.len().saturating_sub(depth + 1)
                );
            }
            state.stack.truncate(depth);
            state.journal.push(StageEvent::Exited {
                path: path.to_string(),
                elapsed,
                outcome: outcome.clone(),
            });
        }

        match outcome {
            StageOutcome::Succeeded => log::info!("[{path}] finished in {elapsed:.2?}"),
            StageOutcome::Failed(reason) => {
                log::warn!("[{path}] failed after {elapsed:.2?}: {reason}");
            }
        }
    }

    /// Number of currently open stages.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state().stack.len()
    }

    /// Number of enter and exit events recorded so far.
    #[must_use]
    pub fn balance(&self) -> (usize, usize) {
        let state = self.state();
        let entered = state
            .journal
            .iter()
            .filter(|event| matches!(event, StageEvent::Entered { .. }))
            .count();
        (entered, state.journal.len() - entered)
    }

    /// Removes and returns the journal recorded so far.
    pub fn take_journal(&self) -> Vec<StageEvent> {
        std::mem::take(&mut self.state().journal)
    }
}

/// Guard for an open stage. Dropping it closes the stage.
///
/// A guard dropped without calling [`Stage::succeed`], [`Stage::fail`] or [`Stage::finish`] is recorded as failed.
#[must_use = "a stage closes as soon as its guard is dropped"]
#[derive(Debug)]
pub struct Stage<'a> {
    tracker: &'a StageTracker,
    path: String,
    depth: usize,
    start: Instant,
    outcome: Option<StageOutcome>,
}

impl Stage<'_> {
    /// Full `outer > inner` path of this stage.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Closes the stage as successful.
    pub fn succeed(mut self) {
        self.outcome = Some(StageOutcome::Succeeded);
    }

    /// Closes the stage as failed.
    pub fn fail(mut self, reason: impl Display) {
        self.outcome = Some(StageOutcome::Failed(reason.to_string()));
    }

    /// Closes the stage according to the given result.
    pub fn finish<T, E: Display>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.succeed(),
            Err(err) => self.fail(err),
        }
    }
}

impl Drop for Stage<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            StageOutcome::Failed(if thread::panicking() {
                "panicked".to_string()
            } else {
                "abandoned".to_string()
            })
        });
        self.tracker
            .exit(&self.path, self.depth, self.start.elapsed(), outcome);
    }
}
