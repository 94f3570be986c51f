//! Starting, stopping, and entering the background daemon.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, error, warn};

use super::Daemon;
use crate::config::Config;
use crate::error::ExitError;
use crate::layout::Layout;
use crate::notify::Notifier;
use crate::process::{LivenessMarker, ProcessHandle};
use crate::runtime::{ContainerRuntime, Credential, DockerCli};
use crate::state::StateStore;
use crate::telemetry;

/// How long `start` waits for the first state snapshot.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Extra time `stop` allows beyond the configured shutdown timeout for the
/// daemon's final reconciliation.
const STOP_GRACE: Duration = Duration::from_secs(15);

/// Command-line overrides forwarded to the daemon child.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub agents: Option<u32>,
    pub model: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(n) = self.agents {
            config.agents.count = n;
        }
        if let Some(model) = &self.model {
            config.agents.model.clone_from(model);
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(n) = self.agents {
            args.extend(["--agents".to_string(), n.to_string()]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        args
    }
}

/// Launch the daemon in the background and wait until it reports running.
///
/// Returns the daemon's pid.
pub fn start(layout: &Layout, config: &Config, overrides: &Overrides) -> anyhow::Result<u32> {
    let runtime = DockerCli::connect(&config.project.name, &config.docker).ok();
    clear_previous_run(layout, runtime.as_ref().map(|r| r as &dyn ContainerRuntime))?;

    let log_path = layout.daemon_log();
    fs::create_dir_all(layout.metamorph_dir())
        .with_context(|| format!("creating {}", layout.metamorph_dir().display()))?;
    let log = File::create(&log_path)
        .with_context(|| format!("creating {}", log_path.display()))?;
    let log_err = log.try_clone().context("duplicating daemon log handle")?;

    let exe = std::env::current_exe().context("locating the metamorph executable")?;
    let mut child = Command::new(exe)
        .arg("start")
        .arg("--daemon-mode")
        .arg("--project-dir")
        .arg(layout.root())
        .args(overrides.args())
        .current_dir(layout.root())
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0)
        .spawn()
        .context("spawning daemon process")?;
    let pid = child.id();
    debug!(pid, "daemon process spawned");

    wait_for_startup(&mut child, layout, STARTUP_TIMEOUT)?;
    Ok(pid)
}

/// Refuse to start over a live daemon, otherwise clear what a dead one left:
/// its liveness marker, its containers, and its last snapshot.
fn clear_previous_run(
    layout: &Layout,
    runtime: Option<&dyn ContainerRuntime>,
) -> anyhow::Result<()> {
    let marker = LivenessMarker::new(&layout.pid_file());
    if let Some(live) = marker.process().filter(ProcessHandle::is_alive) {
        return Err(ExitError::AlreadyRunning { pid: live.pid() }.into());
    }
    marker.remove()?;
    if let Some(runtime) = runtime {
        stop_orphans(runtime);
    }
    StateStore::new(layout).remove()
}

/// Stop containers left behind by a daemon that died without cleaning up.
fn stop_orphans(runtime: &dyn ContainerRuntime) {
    match runtime.list_workers() {
        Ok(workers) if !workers.is_empty() => {
            warn!(count = workers.len(), "stopping orphaned agent containers");
            if let Err(e) = runtime.stop_all_workers() {
                warn!(error = %format!("{e:#}"), "orphan cleanup incomplete");
            }
        }
        Ok(_) => {}
        Err(e) => debug!(error = %format!("{e:#}"), "could not list containers"),
    }
}

fn wait_for_startup(child: &mut Child, layout: &Layout, timeout: Duration) -> anyhow::Result<()> {
    let store = StateStore::new(layout);
    let mut tail = LogTail::new(&layout.daemon_log());
    let mut seen = HashSet::new();
    let deadline = Instant::now() + timeout;

    loop {
        for message in tail.messages() {
            if seen.insert(message.clone()) {
                println!("{}", progress_line(&message));
            }
        }
        if store.exists() {
            return Ok(());
        }
        if let Some(status) = child.try_wait().context("checking daemon process")? {
            let log = fs::read_to_string(layout.daemon_log()).unwrap_or_default();
            anyhow::bail!("daemon exited during startup ({status}):\n{}", log.trim_end());
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "daemon did not report running within {}s; see {}",
                timeout.as_secs(),
                layout.daemon_log().display()
            );
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// "building agent image" -> "Building agent image..."
fn progress_line(message: &str) -> String {
    let mut chars = message.chars();
    chars.next().map_or_else(String::new, |first| {
        format!("{}{}...", first.to_uppercase(), chars.as_str())
    })
}

/// Incremental reader over the daemon's JSON log.
struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl LogTail {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
            partial: String::new(),
        }
    }

    /// Messages from log lines completed since the last call.
    fn messages(&mut self) -> Vec<String> {
        let Ok(mut file) = File::open(&self.path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut buf = Vec::new();
        let Ok(n) = file.read_to_end(&mut buf) else {
            return Vec::new();
        };
        self.offset += n as u64;
        self.partial.push_str(&String::from_utf8_lossy(&buf));

        let complete = match self.partial.rfind('\n') {
            Some(end) => {
                let rest = self.partial.split_off(end + 1);
                std::mem::replace(&mut self.partial, rest)
            }
            None => return Vec::new(),
        };
        complete.lines().filter_map(telemetry::message_of).collect()
    }
}

/// Signal the daemon to stop and wait for it to exit.
///
/// Returns the pid that was stopped.
pub fn stop(layout: &Layout, timeout: Duration) -> anyhow::Result<u32> {
    let marker = LivenessMarker::new(&layout.pid_file());
    let Some(process) = marker.process().filter(ProcessHandle::is_alive) else {
        marker.remove()?;
        return Err(ExitError::NotRunning.into());
    };

    process.terminate()?;
    let deadline = Instant::now() + timeout + STOP_GRACE;
    while process.is_alive() {
        if Instant::now() >= deadline {
            warn!(pid = process.pid(), "daemon did not exit in time, killing it");
            process.kill()?;
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    marker.remove()?;
    Ok(process.pid())
}

/// Daemon-mode entry point: runs until a termination signal arrives.
pub fn run(
    layout: &Layout,
    config: Config,
    credential: Credential,
    runtime: Box<dyn ContainerRuntime>,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<()> {
    let marker = LivenessMarker::new(&layout.pid_file());
    marker.write_current()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing termination handler")?;

    let mut daemon = Daemon::new(
        layout.clone(),
        config,
        credential,
        runtime,
        notifier,
        Utc::now(),
    );
    if let Err(e) = daemon.start_fleet(Utc::now()) {
        error!(error = %format!("{e:#}"), "startup failed");
        if let Err(stop) = daemon.runtime.stop_all_workers() {
            warn!(error = %format!("{stop:#}"), "could not stop partially started agents");
        }
        marker.remove()?;
        return Err(e);
    }
    daemon.run(&rx)
}
