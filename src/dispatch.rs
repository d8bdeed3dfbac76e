//! Turns a verified GitHub delivery into either an ignore reason or a queued
//! deploy job.

use crate::deploy::{DeployJob, JobScheduler, RepositoryName, RepositoryNameError};
use serde_json::Value;
use std::sync::Arc;

/// Only pushes to this ref trigger a deploy.
pub const DEPLOY_REF: &str = "refs/heads/main";

/// Why a delivery was accepted but not acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotPush,
    NotMain,
    MissingRepository,
    InvalidRepositoryName,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotPush => "not a push",
            Self::NotMain => "not main",
            Self::MissingRepository => "missing repository",
            Self::InvalidRepositoryName => "invalid repository name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Queued(RepositoryName),
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid JSON")]
    InvalidJson(#[source] serde_json::Error),
}

/// Run the filter chain over one delivery.
///
/// `repository` may be a bare name or GitHub's repository object; in the
/// latter case its `name` field is used.
pub fn evaluate(event: Option<&str>, payload: &Value) -> Result<DeployJob, IgnoreReason> {
    if event != Some("push") {
        return Err(IgnoreReason::NotPush);
    }
    if payload.get("ref").and_then(Value::as_str) != Some(DEPLOY_REF) {
        return Err(IgnoreReason::NotMain);
    }

    let raw = match payload.get("repository") {
        Some(Value::String(name)) => Some(name.as_str()),
        Some(repo @ Value::Object(_)) => repo.get("name").and_then(Value::as_str),
        _ => None,
    };
    let Some(raw) = raw.filter(|name| !name.is_empty()) else {
        return Err(IgnoreReason::MissingRepository);
    };

    match RepositoryName::parse(raw) {
        Ok(repository) => Ok(DeployJob::new(repository)),
        Err(RepositoryNameError::Empty) => Err(IgnoreReason::MissingRepository),
        Err(RepositoryNameError::Invalid(_)) => Err(IgnoreReason::InvalidRepositoryName),
    }
}

/// Filters deliveries and hands accepted ones to a [`JobScheduler`].
#[derive(Clone)]
pub struct Dispatcher {
    scheduler: Arc<dyn JobScheduler>,
}

impl Dispatcher {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Classify a delivery and schedule its deploy if it passes every filter.
    ///
    /// The body is only parsed once the event is known to be a push. Returns
    /// as soon as the job is handed off; the job's outcome is never observed.
    pub fn handle(&self, event: Option<&str>, body: &[u8]) -> Result<DispatchOutcome, PayloadError> {
        if event != Some("push") {
            tracing::debug!(event = event.unwrap_or("<none>"), "webhook: ignored event type");
            return Ok(DispatchOutcome::Ignored(IgnoreReason::NotPush));
        }

        let payload: Value = serde_json::from_slice(body).map_err(PayloadError::InvalidJson)?;

        match evaluate(event, &payload) {
            Ok(job) => {
                let repository = job.repository.clone();
                tracing::info!(repository = %repository, "webhook: deploy queued");
                self.scheduler.schedule(job);
                Ok(DispatchOutcome::Queued(repository))
            }
            Err(reason) => {
                let git_ref = payload.get("ref").and_then(Value::as_str).unwrap_or("");
                tracing::info!(reason = reason.as_str(), git_ref, "webhook: push ignored");
                Ok(DispatchOutcome::Ignored(reason))
            }
        }
    }
}
