//! Container runtime abstraction for agent workers.
//!
//! The daemon only talks to workers through [`ContainerRuntime`]. The
//! production implementation shells out to the docker CLI; tests substitute
//! an in-memory fake.

pub mod docker;

use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::layout::Layout;

pub use docker::DockerCli;

pub const LABEL_PROJECT: &str = "metamorph.project";
pub const LABEL_AGENT_ID: &str = "metamorph.agent-id";

/// Environment variable holding the OAuth token. Preferred when both are set.
pub const OAUTH_TOKEN_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Model credential handed to workers.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    OauthToken(String),
    ApiKey(String),
}

impl Credential {
    /// Read from the process environment, preferring the OAuth token.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let nonempty = |key| lookup(key).filter(|v| !v.trim().is_empty());
        nonempty(OAUTH_TOKEN_VAR)
            .map(Self::OauthToken)
            .or_else(|| nonempty(API_KEY_VAR).map(Self::ApiKey))
    }

    /// Name of the environment variable the worker expects.
    pub const fn env_name(&self) -> &'static str {
        match self {
            Self::OauthToken(_) => OAUTH_TOKEN_VAR,
            Self::ApiKey(_) => API_KEY_VAR,
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Self::OauthToken(s) | Self::ApiKey(s) => s,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}=<redacted>)", self.env_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerOpts {
    pub project_dir: PathBuf,
    pub id: u32,
    pub role: String,
    pub model: String,
    pub credential: Credential,
    pub git_identity: GitIdentity,
}

/// A worker as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: u32,
    pub container_id: String,
    /// Runtime's own status string, e.g. `running` or `Exited (1) 3s ago`.
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Where workers run.
///
/// Every call may be slow or fail. Only `list_workers`, `start_worker` and
/// `stop_worker` failures drive restart decisions.
pub trait ContainerRuntime: Send + Sync {
    fn build_image(&self, layout: &Layout) -> anyhow::Result<()>;

    /// Start a fresh worker, replacing any stale one with the same id.
    /// Returns the new container id.
    fn start_worker(&self, opts: &WorkerOpts) -> anyhow::Result<String>;

    fn stop_worker(&self, id: u32) -> anyhow::Result<()>;

    fn stop_all_workers(&self) -> anyhow::Result<()>;

    /// All workers of this project, including exited ones.
    fn list_workers(&self) -> anyhow::Result<Vec<WorkerInfo>>;

    /// Worker output. `tail` of `None` means everything.
    fn logs(&self, id: u32, tail: Option<u32>, follow: bool)
    -> anyhow::Result<Box<dyn Read + Send>>;
}
