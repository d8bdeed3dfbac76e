//! Deploy jobs and the markers they leave on disk.
//!
//! A deploy is only a marker: an empty file at
//! `<job-root>/<repository>/<unix-seconds>`. Whatever actually ships the code
//! watches that tree; this crate never reads markers back.

use anyhow::{Context, Result};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

static REPO_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("repository name pattern is valid"));

// ── Repository name ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryNameError {
    #[error("repository name is empty")]
    Empty,
    #[error("repository name {0:?} contains characters outside [a-zA-Z0-9_-]")]
    Invalid(String),
}

/// A repository name that is safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn parse(raw: &str) -> Result<Self, RepositoryNameError> {
        if raw.is_empty() {
            return Err(RepositoryNameError::Empty);
        }
        if !REPO_NAME_PATTERN.is_match(raw) {
            return Err(RepositoryNameError::Invalid(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to deploy one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployJob {
    pub repository: RepositoryName,
}

impl DeployJob {
    pub fn new(repository: RepositoryName) -> Self {
        Self { repository }
    }
}

// ── Marker files ──────────────────────────────────────────────────────────────

/// Create `<root>/<repository>` if it does not exist yet.
///
/// Safe to call repeatedly and concurrently; existing markers are untouched.
pub async fn ensure_repo_dir(root: &Path, repository: &RepositoryName) -> Result<PathBuf> {
    let dir = root.join(repository.as_str());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create repository directory {}", dir.display()))?;
    Ok(dir)
}

/// Write the marker for `job` stamped with `timestamp` (Unix seconds).
///
/// A marker with the same name is truncated: two deploys inside one second
/// collapse into a single marker.
pub async fn write_marker(root: &Path, job: &DeployJob, timestamp: i64) -> Result<PathBuf> {
    let dir = ensure_repo_dir(root, &job.repository).await?;
    let marker = dir.join(timestamp.to_string());
    tokio::fs::File::create(&marker)
        .await
        .with_context(|| format!("failed to create deploy marker {}", marker.display()))?;
    Ok(marker)
}

/// Execute a deploy job: record a marker stamped with the current time.
pub async fn run_deploy(root: &Path, job: &DeployJob) -> Result<PathBuf> {
    write_marker(root, job, chrono::Utc::now().timestamp()).await
}

// ── Scheduling ────────────────────────────────────────────────────────────────

/// Hands deploy jobs to something that runs them outside the request path.
///
/// Implementations must return without waiting for the job.
pub trait JobScheduler: Send + Sync {
    fn schedule(&self, job: DeployJob);
}

/// Spawns one tokio task per job, with at most `max_concurrent` touching the
/// filesystem at a time.
#[derive(Clone)]
pub struct DeployRunner {
    root: PathBuf,
    permits: Arc<Semaphore>,
}

impl DeployRunner {
    pub fn new(root: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            root: root.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Spawn `job` and return its handle. Failures are logged, never returned.
    pub fn spawn(&self, job: DeployJob) -> JoinHandle<()> {
        let root = self.root.clone();
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(repository = %job.repository, "deploy: runner closed, job dropped");
                return;
            };
            match run_deploy(&root, &job).await {
                Ok(marker) => tracing::info!(
                    repository = %job.repository,
                    marker = %marker.display(),
                    "deploy: marker written"
                ),
                Err(e) => tracing::error!(repository = %job.repository, "deploy: {e:#}"),
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }
}

impl JobScheduler for DeployRunner {
    fn schedule(&self, job: DeployJob) {
        // Fire-and-forget: dropping the handle detaches the task.
        drop(self.spawn(job));
    }
}

/// Create the job root at startup.
pub fn prepare_job_root(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create job root {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> DeployJob {
        DeployJob::new(RepositoryName::parse(name).unwrap())
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn repository_names_follow_pattern() {
        for ok in ["myrepo", "my-repo", "my_repo", "Repo42", "-", "_"] {
            assert!(RepositoryName::parse(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["a/b", "..", "../etc", "my repo", "repo.git", "répo", "a\nb", "a\0b"] {
            assert!(
                matches!(RepositoryName::parse(bad), Err(RepositoryNameError::Invalid(_))),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(RepositoryName::parse(""), Err(RepositoryNameError::Empty));
    }

    #[tokio::test]
    async fn marker_is_empty_file_named_by_timestamp() {
        let root = tempfile::tempdir().unwrap();
        let marker = write_marker(root.path(), &job("myrepo"), 1_700_000_000)
            .await
            .unwrap();
        assert_eq!(marker, root.path().join("myrepo").join("1700000000"));
        assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn run_deploy_uses_current_time() {
        let root = tempfile::tempdir().unwrap();
        let before = chrono::Utc::now().timestamp();
        let marker = run_deploy(root.path(), &job("myrepo")).await.unwrap();
        let after = chrono::Utc::now().timestamp();
        let stamp: i64 = marker.file_name().unwrap().to_str().unwrap().parse().unwrap();
        assert!((before..=after).contains(&stamp));
    }

    #[tokio::test]
    async fn ensure_repo_dir_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let repo = RepositoryName::parse("myrepo").unwrap();
        write_marker(root.path(), &job("myrepo"), 1).await.unwrap();

        let first = ensure_repo_dir(root.path(), &repo).await.unwrap();
        let second = ensure_repo_dir(root.path(), &repo).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(entries(&first), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn same_second_markers_collapse() {
        let root = tempfile::tempdir().unwrap();
        write_marker(root.path(), &job("myrepo"), 42).await.unwrap();
        write_marker(root.path(), &job("myrepo"), 42).await.unwrap();
        write_marker(root.path(), &job("myrepo"), 43).await.unwrap();
        assert_eq!(entries(&root.path().join("myrepo")), vec!["42", "43"]);
    }

    #[tokio::test]
    async fn missing_root_parent_is_created() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        write_marker(&nested, &job("myrepo"), 7).await.unwrap();
        assert!(nested.join("myrepo").join("7").is_file());
    }

    #[tokio::test]
    async fn failure_is_reported_to_the_caller_of_run_deploy() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();
        assert!(write_marker(&blocker, &job("myrepo"), 1).await.is_err());
    }

    #[tokio::test]
    async fn runner_writes_marker_in_background() {
        let root = tempfile::tempdir().unwrap();
        let runner = DeployRunner::new(root.path(), 2);
        runner.spawn(job("myrepo")).await.unwrap();
        assert_eq!(entries(&root.path().join("myrepo")).len(), 1);
    }

    #[tokio::test]
    async fn runner_swallows_failures() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        let runner = DeployRunner::new(&blocker, 1);
        // The task finishes normally; the error only reaches the log.
        runner.spawn(job("myrepo")).await.unwrap();
    }

    #[tokio::test]
    async fn runner_waits_for_a_permit() {
        let root = tempfile::tempdir().unwrap();
        let runner = DeployRunner::new(root.path(), 1);
        let held = runner.semaphore().acquire_owned().await.unwrap();

        let handle = runner.spawn(job("myrepo"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!root.path().join("myrepo").exists());

        drop(held);
        handle.await.unwrap();
        assert!(root.path().join("myrepo").is_dir());
    }

    #[test]
    fn prepare_job_root_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let jobs = root.path().join("webhook_jobs");
        prepare_job_root(&jobs).unwrap();
        prepare_job_root(&jobs).unwrap();
        assert!(jobs.is_dir());
    }
}
