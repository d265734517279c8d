//! The JSON summary of a sweep.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuExt, System, SystemExt};

use crate::{pipeline::RunRecord, stage::StageEvent};

/// How a project fared in a sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EntryStatus {
    /// Every workload was measured and recorded.
    Completed,
    /// Every phase ran, but some workload produced no measurements.
    Degraded,
    /// The project was abandoned.
    Failed {
        /// Classification of the failure, e.g. `build_failure`.
        kind: String,
        /// Human readable description of the failure.
        error: String,
    },
}

/// One project's part of a sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    /// Name of the project.
    pub project: String,
    /// Domain tag of the project.
    pub domain: String,
    /// How the project fared.
    pub status: EntryStatus,
    /// Every measured workload execution.
    pub runs: Vec<RunRecord>,
    /// Every stage entered and exited for the project.
    pub stages: Vec<StageEvent>,
}

/// Description of the machine a sweep ran on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Host name, if known.
    pub hostname: Option<String>,
    /// Operating system and version, if known.
    pub os: Option<String>,
    /// Kernel version, if known.
    pub kernel: Option<String>,
    /// Brand of the first CPU.
    pub cpu_brand: String,
    /// Number of logical CPUs.
    pub cpus: usize,
    /// Total memory in bytes.
    pub total_memory: u64,
}

impl HostInfo {
    /// Collects information about this machine.
    #[must_use]
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            hostname: system.host_name(),
            os: system.long_os_version(),
            kernel: system.kernel_version(),
            cpu_brand: system
                .cpus()
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_default(),
            cpus: system.cpus().len(),
            total_memory: system.total_memory(),
        }
    }
}

/// Tally of entry statuses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Projects that completed.
    pub completed: usize,
    /// Projects that completed with missing measurements.
    pub degraded: usize,
    /// Projects that were abandoned.
    pub failed: usize,
}

/// Everything that happened during one sweep of projects under one experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Name of the experiment.
    pub experiment: String,
    /// When the sweep started.
    pub started_at: DateTime<Utc>,
    /// When the sweep finished.
    pub finished_at: DateTime<Utc>,
    /// The machine the sweep ran on, if collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostInfo>,
    /// One entry per project, in sweep order.
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    /// Counts the entries by status.
    #[must_use]
    pub fn summary(&self) -> Summary {
        self.entries
            .iter()
            .fold(Summary::default(), |mut summary, entry| {
                match entry.status {
                    EntryStatus::Completed => summary.completed += 1,
                    EntryStatus::Degraded => summary.degraded += 1,
                    EntryStatus::Failed { .. } => summary.failed += 1,
                }
                summary
            })
    }

    /// Entry of the named project, if it was part of the sweep.
    #[must_use]
    pub fn entry(&self, project: &str) -> Option<&SweepEntry> {
        self.entries.iter().find(|entry| entry.project == project)
    }

    /// Writes the report as pretty JSON into `dir`, named after the experiment and the start time.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn write(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(format!(
            "sweep.{}.{}.json",
            self.experiment,
            self.started_at.format("%Y-%m-%dT%H-%M-%S%z")
        ));
        log::info!("writing sweep report to {}...", path.display());

        fs::create_dir_all(dir)?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(project: &str, status: EntryStatus) -> SweepEntry {
        SweepEntry {
            project: project.to_string(),
            domain: "scientific".to_string(),
            status,
            runs: Vec::new(),
            stages: Vec::new(),
        }
    }

    fn report() -> SweepReport {
        let now = Utc::now();
        SweepReport {
            experiment: "polly".to_string(),
            started_at: now,
            finished_at: now,
            host: None,
            entries: vec![
                entry("linpack", EntryStatus::Completed),
                entry("leveldb", EntryStatus::Degraded),
                entry(
                    "libressl",
                    EntryStatus::Failed {
                        kind: "build_failure".to_string(),
                        error: "build failed".to_string(),
                    },
                ),
                entry("lulesh", EntryStatus::Completed),
            ],
        }
    }

    #[test]
    fn summary_counts_statuses() {
        assert_eq!(
            report().summary(),
            Summary {
                completed: 2,
                degraded: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn write_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let report = report();

        let path = report.write(&dir.path().join("results")).unwrap();

        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sweep.polly."));
        let read: SweepReport = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(read, report);
    }

    #[test]
    fn failed_entries_carry_their_kind() {
        let json = serde_json::to_value(report().entry("libressl").unwrap()).unwrap();

        assert_eq!(json["status"]["status"], "failed");
        assert_eq!(json["status"]["kind"], "build_failure");
    }

    #[test]
    fn host_info_counts_cpus() {
        assert!(HostInfo::collect().cpus >= 1);
    }
}
