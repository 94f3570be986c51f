//! Persisted daemon snapshot.
//!
//! The daemon is the only writer. Writes go to a temp file in the same
//! directory and are renamed over the canonical path, so readers see either
//! the previous snapshot or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::Layout;
use crate::process::LivenessMarker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Exited,
    Created,
    Stopped,
    Unknown,
}

impl AgentStatus {
    /// Normalize a container runtime's state string.
    pub fn from_runtime(raw: &str) -> Self {
        let raw = raw.to_ascii_lowercase();
        if raw.starts_with("up") || raw.contains("running") {
            Self::Running
        } else if raw.contains("exited") || raw.contains("dead") {
            Self::Exited
        } else if raw.contains("created") {
            Self::Created
        } else {
            Self::Unknown
        }
    }

    /// Only a running worker counts as live. `created` containers never
    /// started, so they are restarted like crashed ones.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Running)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Created => "created",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: u32,
    pub role: String,
    pub container_id: String,
    pub status: AgentStatus,
    pub sessions_completed: u64,
    pub last_activity: DateTime<Utc>,
    pub current_task: Option<String>,
}

impl AgentState {
    pub fn new(id: u32, role: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            role: role.to_string(),
            container_id: String::new(),
            status: AgentStatus::Unknown,
            sessions_completed: 0,
            last_activity: now,
            current_task: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_commits: u64,
    pub total_sessions: u64,
    pub tasks_completed: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub status: DaemonStatus,
    pub started_at: DateTime<Utc>,
    pub project_name: String,
    pub agents: Vec<AgentState>,
    pub stats: Stats,
}

impl DaemonState {
    pub fn new(project_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            status: DaemonStatus::Running,
            started_at,
            project_name: project_name.to_string(),
            agents: Vec::new(),
            stats: Stats::default(),
        }
    }

    pub fn agent_mut(&mut self, id: u32) -> Option<&mut AgentState> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    pub fn update_uptime(&mut self, now: DateTime<Utc>) {
        let secs = (now - self.started_at).num_seconds();
        self.stats.uptime_seconds = u64::try_from(secs).unwrap_or(0);
    }

    /// Mark the daemon and every running agent stopped.
    pub fn mark_stopped(&mut self) {
        self.status = DaemonStatus::Stopped;
        for agent in &mut self.agents {
            if agent.status == AgentStatus::Running {
                agent.status = AgentStatus::Stopped;
            }
        }
    }
}

/// Reads and writes `.metamorph/state.json` and the heartbeat file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    heartbeat: PathBuf,
    marker: LivenessMarker,
}

impl StateStore {
    pub fn new(layout: &Layout) -> Self {
        Self {
            path: layout.state_file(),
            heartbeat: layout.heartbeat_file(),
            marker: LivenessMarker::new(&layout.pid_file()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Atomically replace the snapshot.
    pub fn write(&self, state: &DaemonState) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(state).context("serializing daemon state")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = self.tmp_path();
        if let Err(e) = write_synced(&tmp, json.as_bytes()) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("renaming into {}", self.path.display()));
        }
        Ok(())
    }

    /// Load the snapshot, downgrading `running` to `stopped` when no live
    /// daemon backs it.
    pub fn read(&self) -> anyhow::Result<DaemonState> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut state: DaemonState = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if !self.marker.is_alive() {
            state.mark_stopped();
        }
        Ok(state)
    }

    /// Delete a previous run's snapshot. Missing is fine.
    pub fn remove(&self) -> anyhow::Result<()> {
        for path in [&self.path, &self.tmp_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
            }
        }
        Ok(())
    }

    pub fn write_heartbeat(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        fs::write(
            &self.heartbeat,
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
        .with_context(|| format!("writing {}", self.heartbeat.display()))
    }

    pub fn read_heartbeat(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(&self.heartbeat).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", path.display()))
}
