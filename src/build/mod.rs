//! Build records and the shared build-status table.
//!
//! This module provides:
//! - [`BuildTable`] - the one table of builds, guarded by a single lock
//! - [`supervisor`] - launching the image tool and awaiting it in the background
//! - [`tail`] - poll-based tailing of a build log
//!
//! Status transitions are monotonic: once a build is `completed` or `failed`
//! nothing moves it again.

pub mod supervisor;
pub mod tail;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;

use crate::plugin::{PluginError, PluginResult};

/// Lifecycle of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Building,
    Completed,
    Failed,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Completed | BuildState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Queued => "queued",
            BuildState::Building => "building",
            BuildState::Completed => "completed",
            BuildState::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a build, as returned by `getBuildStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub build_id: String,
    pub project_id: String,
    pub status: BuildState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// How a build ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed {
        download_url: String,
        artifact_sha256: Option<String>,
    },
    Failed(String),
}

/// Shared flag asking a running build to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`BuildTable::begin`].
#[derive(Debug, Clone)]
pub struct StartedBuild {
    pub build_id: String,
    pub log_path: PathBuf,
    pub cancel: CancelToken,
}

#[derive(Debug)]
struct BuildRecord {
    snapshot: BuildSnapshot,
    log_path: PathBuf,
    cancel: CancelToken,
}

#[derive(Debug, Default)]
struct TableState {
    builds: HashMap<(String, String), BuildRecord>,
    /// Most recent build id per project.
    latest: HashMap<String, String>,
}

/// Build-status table shared between request handlers and background tasks.
///
/// Cloning is cheap; all clones see the same table.
#[derive(Debug, Clone, Default)]
pub struct BuildTable {
    state: Arc<Mutex<TableState>>,
    next_id: Arc<AtomicU64>,
}

impl BuildTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new build for `project_id` in the `building` state.
    ///
    /// Fails with [`PluginError::BuildInProgress`] if the project's most recent
    /// build has not reached a terminal status. The check and the insert
    /// happen under one lock acquisition.
    pub fn begin(
        &self,
        project_id: &str,
        log_path_for: impl FnOnce(&str) -> PathBuf,
    ) -> PluginResult<StartedBuild> {
        let mut state = self.lock();

        if let Some(active) = state.latest.get(project_id) {
            let key = (project_id.to_string(), active.clone());
            if let Some(record) = state.builds.get(&key) {
                if !record.snapshot.status.is_terminal() {
                    return Err(PluginError::BuildInProgress {
                        project_id: project_id.to_string(),
                        build_id: active.clone(),
                    });
                }
            }
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let build_id = format!("build-{n}");
        let log_path = log_path_for(&build_id);
        let cancel = CancelToken::default();

        let snapshot = BuildSnapshot {
            build_id: build_id.clone(),
            project_id: project_id.to_string(),
            status: BuildState::Building,
            progress: Some(0),
            error_message: None,
            download_url: None,
            artifact_sha256: None,
            started_at: Some(now_utc_rfc3339()),
            finished_at: None,
        };
        state.builds.insert(
            (project_id.to_string(), build_id.clone()),
            BuildRecord {
                snapshot,
                log_path: log_path.clone(),
                cancel: cancel.clone(),
            },
        );
        state
            .latest
            .insert(project_id.to_string(), build_id.clone());

        Ok(StartedBuild {
            build_id,
            log_path,
            cancel,
        })
    }

    /// Move a build to its terminal status.
    ///
    /// Returns `false` (and changes nothing) if the build is unknown or
    /// already terminal.
    pub fn finish(&self, project_id: &str, build_id: &str, outcome: BuildOutcome) -> bool {
        let mut state = self.lock();
        let key = (project_id.to_string(), build_id.to_string());
        let Some(record) = state.builds.get_mut(&key) else {
            return false;
        };
        if record.snapshot.status.is_terminal() {
            return false;
        }

        let snapshot = &mut record.snapshot;
        snapshot.finished_at = Some(now_utc_rfc3339());
        match outcome {
            BuildOutcome::Completed {
                download_url,
                artifact_sha256,
            } => {
                snapshot.status = BuildState::Completed;
                snapshot.progress = Some(100);
                snapshot.download_url = Some(download_url);
                snapshot.artifact_sha256 = artifact_sha256;
                snapshot.error_message = None;
            }
            BuildOutcome::Failed(message) => {
                snapshot.status = BuildState::Failed;
                snapshot.error_message = Some(message);
                snapshot.download_url = None;
            }
        }
        true
    }

    pub fn snapshot(&self, project_id: &str, build_id: &str) -> Option<BuildSnapshot> {
        self.lock()
            .builds
            .get(&(project_id.to_string(), build_id.to_string()))
            .map(|record| record.snapshot.clone())
    }

    /// Snapshot of the project's most recent build, if any.
    pub fn latest(&self, project_id: &str) -> Option<BuildSnapshot> {
        let state = self.lock();
        let build_id = state.latest.get(project_id)?;
        state
            .builds
            .get(&(project_id.to_string(), build_id.clone()))
            .map(|record| record.snapshot.clone())
    }

    pub fn log_path(&self, project_id: &str, build_id: &str) -> Option<PathBuf> {
        self.lock()
            .builds
            .get(&(project_id.to_string(), build_id.to_string()))
            .map(|record| record.log_path.clone())
    }

    /// True once the build is terminal. Unknown builds count as terminal so
    /// that anything waiting on them stops.
    pub fn is_terminal(&self, project_id: &str, build_id: &str) -> bool {
        self.snapshot(project_id, build_id)
            .map(|snapshot| snapshot.status.is_terminal())
            .unwrap_or(true)
    }

    /// Request cancellation and return the current snapshot.
    pub fn cancel(&self, project_id: &str, build_id: &str) -> Option<BuildSnapshot> {
        let state = self.lock();
        let record = state
            .builds
            .get(&(project_id.to_string(), build_id.to_string()))?;
        if !record.snapshot.status.is_terminal() {
            record.cancel.cancel();
        }
        Some(record.snapshot.clone())
    }
}

pub(crate) fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
