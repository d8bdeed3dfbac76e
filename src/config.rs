//! Service configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `DEPLOYHOOK_*` environment variables. CLI flags are applied last by `main`.
//! The webhook secret only ever comes from `GITHUB_WEBHOOK_SECRET`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable holding the shared GitHub webhook secret.
pub const SECRET_ENV: &str = "GITHUB_WEBHOOK_SECRET";

const BIND_ENV: &str = "DEPLOYHOOK_BIND";
const JOB_ROOT_ENV: &str = "DEPLOYHOOK_JOB_ROOT";
const BANNER_ENV: &str = "DEPLOYHOOK_BANNER";

const DEFAULT_JOB_ROOT: &str = "/app/webhook_jobs";

// ── Secret ────────────────────────────────────────────────────────────────────

/// Shared secret used to sign GitHub webhook deliveries.
///
/// Loaded once at startup and never mutated afterwards. `Debug` is redacted so
/// the value cannot leak through logs or `check-config` output.
#[derive(Clone)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    /// Build a secret from a raw value, trimming quotes and whitespace that
    /// commonly leak in from `.env` files and container env blocks.
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_matches(|c| matches!(c, '\'' | ' ' | '\t' | '\n' | '\r'));
        if trimmed.is_empty() {
            bail!("{SECRET_ENV} is set but empty");
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Load the secret from the environment. Refuses to continue without one.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(SECRET_ENV)
            .with_context(|| format!("{SECRET_ENV} environment variable is required"))?;
        Self::new(&raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(<redacted>)")
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub bind: SocketAddr,
    /// Root directory under which per-repository deploy markers are written.
    pub job_root: PathBuf,
    /// Optional environment marker prefixed to the hostname on `GET /`.
    pub banner: Option<String>,
    /// Upper bound on webhook request bodies.
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    /// Number of deploy jobs allowed to touch the filesystem at once.
    pub max_concurrent_deploys: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            job_root: PathBuf::from(DEFAULT_JOB_ROOT),
            banner: None,
            max_body_bytes: 1024 * 1024,
            request_timeout_secs: 10,
            max_concurrent_deploys: 4,
        }
    }
}

impl Config {
    /// Resolve the effective configuration.
    ///
    /// `path` wins when given and must exist. Otherwise the platform config
    /// directory is probed for `config.toml`; a missing file there just means
    /// defaults.
    pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config: {}", path.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config.job_root = expand_path(&config.job_root)?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(BIND_ENV) {
            self.bind = bind
                .trim()
                .parse()
                .with_context(|| format!("{BIND_ENV} is not a socket address: {bind}"))?;
        }
        if let Some(root) = lookup(JOB_ROOT_ENV) {
            self.job_root = expand_path(Path::new(root.trim()))?;
        }
        if let Some(banner) = lookup(BANNER_ENV) {
            let banner = banner.trim();
            self.banner = (!banner.is_empty()).then(|| banner.to_string());
        }
        Ok(())
    }

    /// Apply command-line overrides; paths are expanded like file and env values.
    pub fn apply_overrides(&mut self, bind: Option<SocketAddr>, job_root: Option<&Path>) -> Result<()> {
        if let Some(bind) = bind {
            self.bind = bind;
        }
        if let Some(root) = job_root {
            self.job_root = expand_path(root)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_root.as_os_str().is_empty() {
            bail!("job_root must not be empty");
        }
        if self.max_body_bytes == 0 {
            bail!("max_body_bytes must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_deploys == 0 {
            bail!("max_concurrent_deploys must be greater than zero");
        }
        Ok(())
    }
}

/// `<platform config dir>/config.toml`, e.g. `~/.config/deployhook/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "deployhook")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("cannot expand path: {raw}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
