//! Launching the image tool and awaiting it off the request path.
//!
//! [`launch`] returns as soon as the child process exists. A named background
//! thread then waits for it, honours cancellation, looks for the artifact
//! and records the terminal status in the [`BuildTable`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::{BuildOutcome, BuildTable, CancelToken};

/// How often the supervisor checks the child and the cancel flag.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Where a successful build is expected to leave its image, and how it is
/// published.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    /// Directory the tool writes images into.
    pub dir: PathBuf,
    /// File name must start with this...
    pub prefix: String,
    /// ...and end with this.
    pub suffix: String,
    /// Locator prefix; the locator is `<download_base>/<project_id>/<file>`.
    pub download_base: String,
}

/// Everything needed to run one build.
#[derive(Debug)]
pub struct BuildJob {
    pub project_id: String,
    pub build_id: String,
    pub command: Command,
    pub log_path: PathBuf,
    pub artifact: ArtifactSpec,
    pub cancel: CancelToken,
}

/// Start the build tool with output written to the build log and hand the
/// child to a background thread.
///
/// Errors mean the tool never started; the caller owns recording that.
pub fn launch(table: &BuildTable, job: BuildJob) -> Result<()> {
    let BuildJob {
        project_id,
        build_id,
        mut command,
        log_path,
        artifact,
        cancel,
    } = job;

    // A fresh log per build; a leftover file from an earlier session is
    // never replayed.
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("opening build log '{}'", log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("duplicating build log handle '{}'", log_path.display()))?;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    info!(
        project_id = %project_id,
        build_id = %build_id,
        command = ?command,
        log = %log_path.display(),
        "launching build tool"
    );
    let program = command.get_program().to_os_string();

    // The child is spawned on the supervisor thread itself so it is never
    // left without a waiter; the spawn result comes back over the channel.
    let (tx, rx) = mpsc::channel();
    let table = table.clone();
    std::thread::Builder::new()
        .name(format!("supervise-{build_id}"))
        .spawn(move || {
            let child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            let _ = tx.send(Ok(()));
            supervise(child, &table, &project_id, &build_id, &artifact, &cancel);
        })
        .context("spawning build supervisor thread")?;

    rx.recv()
        .context("build supervisor exited before reporting launch")?
        .with_context(|| format!("starting build tool {:?}", program))?;
    Ok(())
}

fn supervise(
    mut child: Child,
    table: &BuildTable,
    project_id: &str,
    build_id: &str,
    artifact: &ArtifactSpec,
    cancel: &CancelToken,
) {
    let outcome = match wait_for_exit(&mut child, cancel) {
        Ok(Some(status)) if status.success() => artifact_outcome(project_id, artifact),
        Ok(Some(status)) => BuildOutcome::Failed(format!("build tool exited with {status}")),
        Ok(None) => BuildOutcome::Failed("build cancelled".to_string()),
        Err(e) => BuildOutcome::Failed(format!("{e:#}")),
    };

    match &outcome {
        BuildOutcome::Completed { download_url, .. } => {
            info!(project_id, build_id, download_url = %download_url, "build completed")
        }
        BuildOutcome::Failed(reason) => {
            warn!(project_id, build_id, reason = %reason, "build failed")
        }
    }

    if !table.finish(project_id, build_id, outcome) {
        warn!(project_id, build_id, "build already terminal; outcome dropped");
    }
}

/// Wait for the child. `Ok(None)` means it was killed on cancellation.
fn wait_for_exit(child: &mut Child, cancel: &CancelToken) -> Result<Option<ExitStatus>> {
    loop {
        if cancel.is_cancelled() {
            stop_child(child).context("stopping cancelled build tool")?;
            return Ok(None);
        }
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {}
            Err(e) => {
                if let Err(stop) = stop_child(child) {
                    warn!(error = ?stop, "could not stop build tool after wait failure");
                }
                return Err(e).context("waiting for build tool");
            }
        }
        std::thread::sleep(WAIT_POLL);
    }
}

/// Kill the child and reap it.
fn stop_child(child: &mut Child) -> Result<()> {
    // kill() fails if the child already exited; the wait below reaps it either way.
    let _ = child.kill();
    child.wait().context("reaping build tool")?;
    Ok(())
}

fn artifact_outcome(project_id: &str, artifact: &ArtifactSpec) -> BuildOutcome {
    let found = match find_artifact(artifact) {
        Ok(found) => found,
        Err(e) => return BuildOutcome::Failed(format!("{e:#}")),
    };
    let Some(path) = found else {
        return BuildOutcome::Failed(format!(
            "artifact missing: build tool succeeded but no '{}*{}' found in '{}'",
            artifact.prefix,
            artifact.suffix,
            artifact.dir.display()
        ));
    };

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let download_url = format!(
        "{}/{}/{}",
        artifact.download_base.trim_end_matches('/'),
        project_id,
        file_name
    );

    let artifact_sha256 = match sha256_file(&path) {
        Ok(sha) => Some(sha),
        Err(e) => return BuildOutcome::Failed(format!("{e:#}")),
    };

    BuildOutcome::Completed {
        download_url,
        artifact_sha256,
    }
}

/// Newest regular file in `spec.dir` whose name matches the naming convention.
pub fn find_artifact(spec: &ArtifactSpec) -> Result<Option<PathBuf>> {
    if !spec.dir.is_dir() {
        return Ok(None);
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(&spec.dir)
        .with_context(|| format!("reading artifact directory '{}'", spec.dir.display()))?
    {
        let entry = entry.with_context(|| {
            format!("iterating artifact directory '{}'", spec.dir.display())
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if !name.starts_with(&spec.prefix) || !name.ends_with(&spec.suffix) || !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(best, _)| modified >= *best) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("opening artifact '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("hashing artifact '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
