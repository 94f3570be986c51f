use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::subprocess::Tool;

/// Built-in agent roles and what each one is for.
pub const AGENT_ROLES: &[(&str, &str)] = &[
    ("developer", "Implements new features and writes production code"),
    ("tester", "Writes and maintains test suites for code quality"),
    ("refactorer", "Improves code structure without changing behavior"),
    ("documenter", "Writes documentation, comments, and READMEs"),
    ("optimizer", "Profiles and optimizes performance bottlenecks"),
    ("reviewer", "Reviews code changes and suggests improvements"),
];

pub const DEFAULT_IMAGE: &str = "metamorph-agent:latest";

pub fn is_known_role(role: &str) -> bool {
    AGENT_ROLES.iter().any(|(name, _)| *name == role)
}

/// Top-level metamorph.toml config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub project: ProjectConfig,
    pub agents: AgentsConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentsConfig {
    pub count: u32,
    pub model: String,
    /// Roles assigned round-robin to agent slots; empty means all developers.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl AgentsConfig {
    /// Role for a 1-based agent slot.
    pub fn role_for(&self, agent_id: u32) -> String {
        if self.roles.is_empty() || agent_id == 0 {
            return "developer".to_string();
        }
        let idx = (agent_id as usize - 1) % self.roles.len();
        self.roles[idx].clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub extra_packages: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            extra_packages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TestingConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub fast_command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NotificationsConfig {
    /// Endpoint that receives JSON event POSTs. Empty disables notifications.
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GitConfig {
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
}

/// Daemon timing knobs. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DaemonConfig {
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_stale_lock_max_age")]
    pub stale_lock_max_age_secs: u64,
    #[serde(default = "default_commit_batch_window")]
    pub commit_batch_window_secs: u64,
    #[serde(default = "default_error_cooldown")]
    pub error_cooldown_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval(),
            stale_lock_max_age_secs: default_stale_lock_max_age(),
            commit_batch_window_secs: default_commit_batch_window(),
            error_cooldown_secs: default_error_cooldown(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl DaemonConfig {
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub const fn stale_lock_max_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_max_age_secs)
    }

    pub const fn commit_batch_window(&self) -> Duration {
        Duration::from_secs(self.commit_batch_window_secs)
    }

    pub const fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// Default value functions for serde
fn default_image() -> String { DEFAULT_IMAGE.into() }
fn default_monitor_interval() -> u64 { 30 }
fn default_stale_lock_max_age() -> u64 { 2 * 60 * 60 }
fn default_commit_batch_window() -> u64 { 60 }
fn default_error_cooldown() -> u64 { 5 * 60 }
fn default_shutdown_timeout() -> u64 { 30 }

impl Config {
    /// Load, default, and validate a metamorph.toml.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::parse_toml(&contents)?;
        config.fill_git_identity();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string (no validation).
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid metamorph.toml: {e}")).into())
    }

    /// Starter config written by `metamorph init`.
    pub fn starter(project_name: &str) -> Self {
        Self {
            project: ProjectConfig {
                name: project_name.to_string(),
                description: String::new(),
            },
            agents: AgentsConfig {
                count: 4,
                model: "claude-opus-4-6".to_string(),
                roles: vec![
                    "developer".into(),
                    "developer".into(),
                    "tester".into(),
                    "refactorer".into(),
                ],
            },
            docker: DockerConfig::default(),
            testing: TestingConfig::default(),
            notifications: NotificationsConfig::default(),
            git: GitConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.name.trim().is_empty() {
            return Err(ExitError::Config("project.name is required".into()).into());
        }
        if self.agents.count == 0 {
            return Err(
                ExitError::Config("agents.count must be greater than 0".into()).into(),
            );
        }
        if self.agents.model.trim().is_empty() {
            return Err(ExitError::Config("agents.model is required".into()).into());
        }
        if let Some(bad) = self.agents.roles.iter().find(|r| !is_known_role(r)) {
            let known: Vec<&str> = AGENT_ROLES.iter().map(|(n, _)| *n).collect();
            return Err(ExitError::Config(format!(
                "invalid agent role {bad:?} (expected one of: {})",
                known.join(", ")
            ))
            .into());
        }
        if self.daemon.monitor_interval_secs == 0 {
            return Err(ExitError::Config(
                "daemon.monitor_interval_secs must be greater than 0".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Fill an empty git identity from the user's global git config.
    fn fill_git_identity(&mut self) {
        if self.git.author_name.is_empty() {
            self.git.author_name = git_config_value("user.name").unwrap_or_default();
        }
        if self.git.author_email.is_empty() {
            self.git.author_email = git_config_value("user.email").unwrap_or_default();
        }
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# Metamorph project configuration\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        let roles: Vec<&str> = AGENT_ROLES.iter().map(|(n, _)| *n).collect();
        set_table_comment(
            &mut doc,
            "agents",
            &format!(
                "\n# Agent fleet. Roles are assigned round-robin: {}\n",
                roles.join(", ")
            ),
        );
        set_table_comment(&mut doc, "docker", "\n# Agent container image\n");
        set_table_comment(&mut doc, "testing", "\n# Commands agents use to verify work\n");
        set_table_comment(
            &mut doc,
            "notifications",
            "\n# Webhook for agent_crashed, commits_pushed, stale_lock, test_failure events\n",
        );
        set_table_comment(
            &mut doc,
            "git",
            "\n# Commit identity for agents (empty = your git config)\n",
        );
        set_table_comment(&mut doc, "daemon", "\n# Supervisor timing (seconds)\n");

        Ok(doc.to_string())
    }
}

fn git_config_value(key: &str) -> Option<String> {
    let output = Tool::new("git")
        .args(&["config", key])
        .timeout(Duration::from_secs(5))
        .run()
        .ok()?;
    let value = output.stdout.trim();
    if output.success() && !value.is_empty() {
        Some(value.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_toml_config() {
        let toml_str = r#"
[project]
name = "myapp"
description = "a thing"

[agents]
count = 3
model = "claude-sonnet"
roles = ["developer", "tester"]

[docker]
image = "custom:1"
extra_packages = ["ripgrep"]

[testing]
command = "cargo test"
fast_command = "cargo check"

[notifications]
webhook_url = "http://localhost:9000/hook"

[git]
author_name = "Bot"
author_email = "bot@example.com"

[daemon]
monitor_interval_secs = 10
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.project.name, "myapp");
        assert_eq!(config.agents.count, 3);
        assert_eq!(config.docker.image, "custom:1");
        assert_eq!(config.docker.extra_packages, vec!["ripgrep"]);
        assert_eq!(config.notifications.webhook_url, "http://localhost:9000/hook");
        assert_eq!(config.git.author_name, "Bot");
        assert_eq!(config.daemon.monitor_interval(), Duration::from_secs(10));
        assert_eq!(config.daemon.stale_lock_max_age_secs, 7200);
    }

    #[test]
    fn parse_minimal_toml_config() {
        let config = Config::parse_toml(
            r#"
[project]
name = "tiny"

[agents]
count = 1
model = "m"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.docker.image, DEFAULT_IMAGE);
        assert!(config.notifications.webhook_url.is_empty());
        assert_eq!(config.daemon.monitor_interval_secs, 30);
        assert_eq!(config.daemon.commit_batch_window_secs, 60);
        assert_eq!(config.daemon.error_cooldown_secs, 300);
    }

    #[test]
    fn roles_assigned_round_robin() {
        let agents = AgentsConfig {
            count: 5,
            model: "m".into(),
            roles: vec!["developer".into(), "tester".into()],
        };
        assert_eq!(agents.role_for(1), "developer");
        assert_eq!(agents.role_for(2), "tester");
        assert_eq!(agents.role_for(3), "developer");
        let none = AgentsConfig {
            count: 2,
            model: "m".into(),
            roles: vec![],
        };
        assert_eq!(none.role_for(2), "developer");
    }

    #[test]
    fn rejects_unknown_role() {
        let mut config = Config::starter("p");
        config.agents.roles = vec!["wizard".into()];
        let err = config.validate().unwrap_err();
        let exit = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit, ExitError::Config(msg) if msg.contains("wizard")));
    }

    #[test]
    fn rejects_zero_agents_and_missing_model() {
        let mut config = Config::starter("p");
        config.agents.count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::starter("p");
        config.agents.model = String::new();
        assert!(config.validate().is_err());

        let config = Config::starter(" ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("[project\nname=").unwrap_err();
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn parse_missing_required_fields() {
        assert!(Config::parse_toml("[project]\nname = \"x\"\n").is_err());
    }

    #[test]
    fn starter_round_trips_through_commented_toml() {
        let config = Config::starter("roundtrip");
        let rendered = config.to_toml().unwrap();
        assert!(rendered.starts_with("# Metamorph project configuration"));
        assert!(rendered.contains("# Agent fleet"));
        let parsed = Config::parse_toml(&rendered).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.project.name, "roundtrip");
        assert_eq!(parsed.agents.roles.len(), 4);
    }
}
