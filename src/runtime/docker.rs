//! [`ContainerRuntime`] backed by the docker CLI.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ContainerRuntime, LABEL_AGENT_ID, LABEL_PROJECT, WorkerInfo, WorkerOpts};
use crate::config::DockerConfig;
use crate::layout::{Layout, UPSTREAM_DIR};
use crate::subprocess::Tool;

const DOCKERFILE: &str = include_str!("../../assets/Dockerfile");
const ENTRYPOINT: &str = include_str!("../../assets/entrypoint.sh");
const SYSTEM_PROMPT: &str = include_str!("../../assets/SYSTEM_PROMPT.md");

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const START_TIMEOUT: Duration = Duration::from_secs(60);
/// `docker stop -t 30` plus headroom for removal.
const STOP_TIMEOUT: Duration = Duration::from_secs(45);
const STOP_GRACE_SECS: &str = "30";
const BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Drives workers through the `docker` command.
#[derive(Debug, Clone)]
pub struct DockerCli {
    project: String,
    image: String,
    extra_packages: Vec<String>,
}

impl DockerCli {
    pub fn new(project: &str, docker: &DockerConfig) -> Self {
        Self {
            project: project.to_string(),
            image: docker.image.clone(),
            extra_packages: docker.extra_packages.clone(),
        }
    }

    /// Like [`DockerCli::new`], but fails if the docker daemon is unreachable.
    pub fn connect(project: &str, docker: &DockerConfig) -> anyhow::Result<Self> {
        docker_tool(&["version", "--format", "{{.Server.Version}}"])
            .timeout(PING_TIMEOUT)
            .run_ok()
            .context("docker daemon is not reachable (is Docker running?)")?;
        Ok(Self::new(project, docker))
    }

    pub fn container_name(&self, id: u32) -> String {
        let project: String = self
            .project
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        format!("metamorph-{project}-agent-{id}")
    }

    fn project_filter(&self) -> String {
        format!("label={LABEL_PROJECT}={}", self.project)
    }

    /// Arguments for `docker run`. The credential is passed by name only; its
    /// value travels in the docker CLI's environment.
    fn run_args(&self, opts: &WorkerOpts, mounts: &WorkerMounts) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            self.container_name(opts.id),
            "--label".into(),
            format!("{LABEL_PROJECT}={}", self.project),
            "--label".into(),
            format!("{LABEL_AGENT_ID}={}", opts.id),
            "--restart".into(),
            "unless-stopped".into(),
        ];
        let mut env = |kv: String| {
            args.push("-e".into());
            args.push(kv);
        };
        env(format!("AGENT_ID={}", opts.id));
        env(format!("AGENT_ROLE={}", opts.role));
        env(format!("AGENT_MODEL={}", opts.model));
        env(opts.credential.env_name().to_string());
        if !opts.git_identity.name.is_empty() {
            env(format!("GIT_AUTHOR_NAME={}", opts.git_identity.name));
        }
        if !opts.git_identity.email.is_empty() {
            env(format!("GIT_AUTHOR_EMAIL={}", opts.git_identity.email));
        }

        for (src, target, ro) in [
            (&mounts.upstream, "/upstream", false),
            (&mounts.logs, "/workspace/logs", false),
            (&mounts.prompt, "/workspace/agent_prompt.md", true),
        ] {
            args.push("-v".into());
            let suffix = if ro { ":ro" } else { "" };
            args.push(format!("{}:{target}{suffix}", src.display()));
        }
        args.push(self.image.clone());
        args
    }

    /// Container ids of this project's workers, optionally narrowed to one id.
    fn container_ids(&self, id: Option<u32>) -> anyhow::Result<Vec<String>> {
        let project = self.project_filter();
        let mut args = vec!["ps", "-a", "-q", "--filter", project.as_str()];
        let agent = id.map(|id| format!("label={LABEL_AGENT_ID}={id}"));
        if let Some(ref agent) = agent {
            args.extend(["--filter", agent.as_str()]);
        }
        let out = docker_tool(&args).timeout(LIST_TIMEOUT).run_ok()?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn find_container(&self, id: u32) -> anyhow::Result<String> {
        self.container_ids(Some(id))?
            .into_iter()
            .next()
            .with_context(|| format!("no container found for agent-{id}"))
    }
}

struct WorkerMounts {
    upstream: PathBuf,
    logs: PathBuf,
    prompt: PathBuf,
}

impl WorkerMounts {
    fn prepare(opts: &WorkerOpts) -> anyhow::Result<Self> {
        let layout = Layout::new(&opts.project_dir);
        let prompt = layout.agent_prompt();
        if !prompt.is_file() {
            anyhow::bail!(
                "{} not found in project directory (run 'metamorph init' first)",
                prompt.display()
            );
        }
        let logs = layout.agent_log_dir(opts.id);
        fs::create_dir_all(&logs).with_context(|| format!("creating {}", logs.display()))?;
        Ok(Self {
            upstream: absolute(&opts.project_dir.join(UPSTREAM_DIR))?,
            logs: absolute(&logs)?,
            prompt: absolute(&prompt)?,
        })
    }
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))
}

fn docker_tool(args: &[&str]) -> Tool {
    Tool::new("docker").args(args)
}

fn stop_and_remove(container: &str) -> anyhow::Result<()> {
    docker_tool(&["stop", "-t", STOP_GRACE_SECS, container])
        .timeout(STOP_TIMEOUT)
        .run_ok()
        .with_context(|| format!("stopping container {}", short(container)))?;
    docker_tool(&["rm", container])
        .timeout(LIST_TIMEOUT)
        .run_ok()
        .with_context(|| format!("removing container {}", short(container)))?;
    Ok(())
}

fn short(container: &str) -> &str {
    container.get(..12).unwrap_or(container)
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
}

impl PsEntry {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    fn into_worker(self) -> Option<WorkerInfo> {
        let id = self.label(LABEL_AGENT_ID)?.parse().ok()?;
        let status = if self.state.is_empty() {
            self.status
        } else {
            self.state
        };
        Some(WorkerInfo {
            id,
            container_id: self.id,
            status,
            started_at: parse_docker_time(&self.created_at),
        })
    }
}

/// Parse docker's `2024-01-02 03:04:05 +0000 UTC` timestamps.
fn parse_docker_time(raw: &str) -> Option<DateTime<Utc>> {
    let stamp: Vec<&str> = raw.split_whitespace().take(3).collect();
    DateTime::parse_from_str(&stamp.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_ps(stdout: &str) -> anyhow::Result<Vec<WorkerInfo>> {
    let mut workers = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let entry: PsEntry =
            serde_json::from_str(line).with_context(|| format!("parsing docker ps line {line:?}"))?;
        if let Some(worker) = entry.into_worker() {
            workers.push(worker);
        }
    }
    workers.sort_by_key(|w| w.id);
    Ok(workers)
}

/// Follows `docker logs` output. The child is killed when the stream drops.
struct LogStream {
    child: Child,
    stdout: ChildStdout,
}

impl Read for LogStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ContainerRuntime for DockerCli {
    fn build_image(&self, layout: &Layout) -> anyhow::Result<()> {
        let dir = layout.docker_dir();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        for (name, content) in [
            ("Dockerfile", DOCKERFILE),
            ("entrypoint.sh", ENTRYPOINT),
            ("system_prompt.md", SYSTEM_PROMPT),
        ] {
            let path = dir.join(name);
            fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        }
        make_executable(&dir.join("entrypoint.sh"))?;

        let packages = format!("EXTRA_PACKAGES={}", self.extra_packages.join(" "));
        let dir_arg = dir.to_string_lossy();
        info!(image = %self.image, "building agent image");
        docker_tool(&[
            "build",
            "-q",
            "-t",
            &self.image,
            "--build-arg",
            &packages,
            &dir_arg,
        ])
        .timeout(BUILD_TIMEOUT)
        .run_ok()
        .context("image build failed")?;
        Ok(())
    }

    fn start_worker(&self, opts: &WorkerOpts) -> anyhow::Result<String> {
        let mounts = WorkerMounts::prepare(opts)?;
        let name = self.container_name(opts.id);

        // Clear a stale container holding the name.
        let _ = docker_tool(&["rm", "-f", &name]).timeout(STOP_TIMEOUT).run();

        let args = self.run_args(opts, &mounts);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = docker_tool(&args)
            .env(opts.credential.env_name(), opts.credential.secret())
            .timeout(START_TIMEOUT)
            .run_ok()
            .with_context(|| format!("starting container for agent-{}", opts.id))?;
        let container = out.stdout.trim().to_string();
        debug!(agent = opts.id, container = short(&container), "worker started");
        Ok(container)
    }

    fn stop_worker(&self, id: u32) -> anyhow::Result<()> {
        let container = self.find_container(id)?;
        stop_and_remove(&container).with_context(|| format!("stopping agent-{id}"))
    }

    fn stop_all_workers(&self) -> anyhow::Result<()> {
        let containers = self.container_ids(None)?;
        let errors: Vec<String> = thread::scope(|s| {
            let handles: Vec<_> = containers
                .iter()
                .map(|c| s.spawn(move || stop_and_remove(c).map_err(|e| format!("{e:#}"))))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| match h.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some("stop thread panicked".to_string()),
                })
                .collect()
        });
        if errors.is_empty() {
            Ok(())
        } else {
            for e in &errors {
                warn!(error = %e, "failed to stop worker");
            }
            anyhow::bail!("errors stopping agents: {}", errors.join("; "))
        }
    }

    fn list_workers(&self) -> anyhow::Result<Vec<WorkerInfo>> {
        let filter = self.project_filter();
        let out = docker_tool(&["ps", "-a", "--filter", &filter, "--format", "{{json .}}"])
            .timeout(LIST_TIMEOUT)
            .run_ok()?;
        parse_ps(&out.stdout)
    }

    fn logs(
        &self,
        id: u32,
        tail: Option<u32>,
        follow: bool,
    ) -> anyhow::Result<Box<dyn Read + Send>> {
        let container = self.find_container(id)?;
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        let mut args = vec!["logs", "--tail", tail.as_str()];
        if follow {
            args.push("--follow");
        }
        args.push(container.as_str());
        let mut child = docker_tool(&args).spawn_streaming()?;
        let stdout = child
            .stdout
            .take()
            .context("docker logs stdout was not captured")?;
        Ok(Box::new(LogStream { child, stdout }))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Credential, GitIdentity};

    fn cli() -> DockerCli {
        DockerCli::new("My App", &DockerConfig::default())
    }

    fn opts() -> WorkerOpts {
        WorkerOpts {
            project_dir: PathBuf::from("/proj"),
            id: 3,
            role: "tester".into(),
            model: "claude-sonnet".into(),
            credential: Credential::ApiKey("sk-very-secret".into()),
            git_identity: GitIdentity {
                name: "Dev".into(),
                email: "dev@example.com".into(),
            },
        }
    }

    fn mounts() -> WorkerMounts {
        WorkerMounts {
            upstream: PathBuf::from("/proj/.metamorph/upstream.git"),
            logs: PathBuf::from("/proj/agent_logs/agent-3"),
            prompt: PathBuf::from("/proj/AGENT_PROMPT.md"),
        }
    }

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(cli().container_name(2), "metamorph-my-app-agent-2");
    }

    #[test]
    fn run_args_label_and_mount() {
        let args = cli().run_args(&opts(), &mounts()).join(" ");
        assert!(args.contains("--label metamorph.project=My App"));
        assert!(args.contains("--label metamorph.agent-id=3"));
        assert!(args.contains("-e AGENT_ROLE=tester"));
        assert!(args.contains("-e GIT_AUTHOR_EMAIL=dev@example.com"));
        assert!(args.contains("-v /proj/.metamorph/upstream.git:/upstream"));
        assert!(args.contains("-v /proj/AGENT_PROMPT.md:/workspace/agent_prompt.md:ro"));
        assert!(args.ends_with("metamorph-agent:latest"));
    }

    #[test]
    fn run_args_never_carry_the_secret() {
        let args = cli().run_args(&opts(), &mounts());
        assert!(args.iter().any(|a| a == "ANTHROPIC_API_KEY"));
        assert!(!args.iter().any(|a| a.contains("sk-very-secret")));
    }

    #[test]
    fn parses_ps_json_lines() {
        let stdout = r#"{"ID":"aaaaaaaaaaaa","Labels":"metamorph.agent-id=2,metamorph.project=demo","State":"exited","Status":"Exited (1) 5 seconds ago","CreatedAt":"2024-05-01 10:00:00 +0000 UTC"}
{"ID":"bbbbbbbbbbbb","Labels":"metamorph.project=demo,metamorph.agent-id=1","State":"running","Status":"Up 2 minutes","CreatedAt":"2024-05-01 09:58:00 +0000 UTC"}
{"ID":"cccccccccccc","Labels":"metamorph.project=demo","State":"running","Status":"Up 1 minute","CreatedAt":""}
"#;
        let workers = parse_ps(stdout).unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].id, 1);
        assert_eq!(workers[0].status, "running");
        assert_eq!(workers[1].container_id, "aaaaaaaaaaaa");
        assert_eq!(
            workers[1].started_at.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }

    #[test]
    fn ps_without_state_falls_back_to_status() {
        let workers =
            parse_ps(r#"{"ID":"x","Labels":"metamorph.agent-id=4","Status":"Up 3 hours"}"#)
                .unwrap();
        assert_eq!(workers[0].status, "Up 3 hours");
        assert!(workers[0].started_at.is_none());
    }

    #[test]
    fn garbage_ps_output_is_an_error() {
        assert!(parse_ps("not json").is_err());
        assert!(parse_ps("").unwrap().is_empty());
    }

    #[test]
    fn start_requires_agent_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts();
        o.project_dir = dir.path().to_path_buf();
        let err = WorkerMounts::prepare(&o).err().unwrap();
        assert!(err.to_string().contains("metamorph init"));
    }
}
