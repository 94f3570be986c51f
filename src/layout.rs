//! Paths metamorph reads and writes under a project root.
//!
//! Everything the daemon owns lives under `.metamorph/`. The task-lock
//! directory and per-agent log directories stay visible at the top level so
//! workers can see (and commit) them.

use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "metamorph.toml";
pub const METAMORPH_DIR: &str = ".metamorph";
pub const UPSTREAM_DIR: &str = ".metamorph/upstream.git";
pub const WORKING_COPY_DIR: &str = ".metamorph/work";
pub const STATE_FILE: &str = ".metamorph/state.json";
pub const DAEMON_PID_FILE: &str = ".metamorph/daemon.pid";
pub const HEARTBEAT_FILE: &str = ".metamorph/heartbeat";
pub const DAEMON_LOG_FILE: &str = ".metamorph/daemon.log";
pub const DOCKER_DIR: &str = ".metamorph/docker";
pub const TASK_LOCK_DIR: &str = "current_tasks";
pub const AGENT_LOG_DIR: &str = "agent_logs";
pub const PROGRESS_FILE: &str = "PROGRESS.md";
pub const AGENT_PROMPT_FILE: &str = "AGENT_PROMPT.md";

/// Resolved paths for one project.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn metamorph_dir(&self) -> PathBuf {
        self.root.join(METAMORPH_DIR)
    }

    pub fn upstream(&self) -> PathBuf {
        self.root.join(UPSTREAM_DIR)
    }

    pub fn working_copy(&self) -> PathBuf {
        self.root.join(WORKING_COPY_DIR)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(DAEMON_PID_FILE)
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.root.join(HEARTBEAT_FILE)
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.root.join(DAEMON_LOG_FILE)
    }

    pub fn docker_dir(&self) -> PathBuf {
        self.root.join(DOCKER_DIR)
    }

    pub fn agent_prompt(&self) -> PathBuf {
        self.root.join(AGENT_PROMPT_FILE)
    }

    pub fn agent_log_dir(&self, agent_id: u32) -> PathBuf {
        self.root.join(AGENT_LOG_DIR).join(format!("agent-{agent_id}"))
    }
}

/// Walk up from `start` to the nearest directory containing `metamorph.toml`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_files_live_under_hidden_dir() {
        let layout = Layout::new(Path::new("/proj"));
        for p in [
            layout.upstream(),
            layout.working_copy(),
            layout.state_file(),
            layout.pid_file(),
            layout.heartbeat_file(),
            layout.daemon_log(),
        ] {
            assert!(p.starts_with("/proj/.metamorph"), "{}", p.display());
        }
        assert_eq!(
            layout.agent_log_dir(3),
            PathBuf::from("/proj/agent_logs/agent-3")
        );
    }

    #[test]
    fn finds_root_from_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested).unwrap(), dir.path());
    }

    #[test]
    fn no_root_without_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_project_root(dir.path()).is_none());
    }
}
