//! GitHub push webhook receiver.
//!
//! Verifies `X-Hub-Signature-256`, keeps only pushes to `refs/heads/main` for
//! well-formed repository names, and records a deploy marker in the background.

pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod signature;
pub mod webhook;

pub use config::{Config, WebhookSecret};
pub use deploy::{DeployJob, DeployRunner, JobScheduler, RepositoryName};
pub use dispatch::{DispatchOutcome, Dispatcher, IgnoreReason};
pub use signature::{AuthError, SignatureVerifier};
