//! One monitor tick.
//!
//! Steps run in a fixed order and each is isolated: an error or panic in one
//! is logged and the rest of the tick still runs. Liveness is refreshed before
//! restart decisions, and both happen before the snapshot is persisted.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::Daemon;
use crate::locks;
use crate::notify::{Event, EventKind};
use crate::state::AgentStatus;

/// Lines from the end of the newest session log checked for failures.
const LOG_TAIL_LINES: usize = 50;

fn error_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ERROR:|FAIL").expect("error marker pattern is valid"))
}

impl Daemon {
    pub fn tick(&mut self, now: DateTime<Utc>) {
        debug!("monitor tick");
        self.deliveries.retain(|h| !h.is_finished());

        let listed = self.step("refresh workers", Self::refresh_workers);
        if listed {
            self.step("restart workers", |d| {
                d.restart_crashed(now);
                Ok(())
            });
        }
        let mut new_commits = false;
        self.step("count commits", |d| {
            new_commits = d.count_commits(now)?;
            Ok(())
        });
        if new_commits {
            self.step("sync repositories", |d| d.sync_repos());
        }
        self.step("current tasks", Self::refresh_tasks);

        self.step("expire locks", |d| d.expire_locks(now));
        self.step("scan agent logs", |d| {
            d.scan_logs(now);
            Ok(())
        });
        self.step("flush commit batch", |d| {
            d.flush_commit_batch(now);
            Ok(())
        });
        self.step("persist state", |d| d.persist(now));
    }

    /// Run one tick step, containing its failure. Returns whether it succeeded.
    fn step(&mut self, name: &str, f: impl FnOnce(&mut Self) -> anyhow::Result<()>) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(step = name, error = %format!("{e:#}"), "tick step failed");
                false
            }
            Err(_) => {
                error!(step = name, "tick step panicked");
                false
            }
        }
    }

    /// Copy runtime status onto agent slots, matched by agent id.
    fn refresh_workers(&mut self) -> anyhow::Result<()> {
        let workers = self.runtime.list_workers().context("listing workers")?;
        let by_id: HashMap<u32, _> = workers.into_iter().map(|w| (w.id, w)).collect();
        for agent in &mut self.state.agents {
            if let Some(worker) = by_id.get(&agent.id) {
                agent.container_id.clone_from(&worker.container_id);
                agent.status = AgentStatus::from_runtime(&worker.status);
            } else {
                agent.status = AgentStatus::Stopped;
            }
        }
        Ok(())
    }

    /// Replace every worker that is not live. Failures are retried next tick.
    fn restart_crashed(&mut self, now: DateTime<Utc>) {
        let down: Vec<(u32, String)> = self
            .state
            .agents
            .iter()
            .filter(|a| !a.status.is_live())
            .map(|a| (a.id, a.role.clone()))
            .collect();

        for (id, role) in down {
            // Clears an exited container; there may be nothing to stop.
            if let Err(e) = self.runtime.stop_worker(id) {
                debug!(agent = id, error = %format!("{e:#}"), "stop before restart failed");
            }
            match self.runtime.start_worker(&self.worker_opts(id, &role)) {
                Ok(container) => {
                    if let Some(agent) = self.state.agent_mut(id) {
                        agent.container_id = container;
                        agent.status = AgentStatus::Running;
                        agent.last_activity = now;
                    }
                    warn!(agent = id, role = %role, "restarted crashed agent");
                    let event = Event::new(
                        EventKind::AgentCrashed,
                        &self.config.project.name,
                        format!("agent-{id} ({role}) crashed and was restarted"),
                    )
                    .agent(id, &role)
                    .at(now);
                    self.notify(event);
                }
                Err(e) => {
                    warn!(agent = id, error = %format!("{e:#}"), "restart failed");
                }
            }
        }
    }

    /// Derive each agent's current task from the lock listing.
    fn refresh_tasks(&mut self) -> anyhow::Result<()> {
        let locks = locks::list(self.reconciler.working_copy())?;
        let mut by_agent: HashMap<u32, String> = HashMap::new();
        for lock in locks {
            by_agent.entry(lock.agent_id).or_insert(lock.name);
        }
        for agent in &mut self.state.agents {
            agent.current_task = by_agent.remove(&agent.id);
        }
        Ok(())
    }

    /// Returns true when the upstream gained commits since the last tick.
    fn count_commits(&mut self, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let count = self.reconciler.commit_count()?;
        let previous = self.prev_commit_count.replace(count);
        self.state.stats.total_commits = count;

        let Some(previous) = previous else {
            return Ok(false);
        };
        if count <= previous {
            return Ok(false);
        }
        let subjects = self.reconciler.recent_subjects(count - previous)?;
        info!(new = count - previous, from_agents = subjects.len(), "new commits upstream");
        if !subjects.is_empty() {
            self.batch_started.get_or_insert(now);
            self.pending_commits.extend(subjects);
        }
        Ok(true)
    }

    fn expire_locks(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let max_age = self.config.daemon.stale_lock_max_age();
        let expired = locks::expire_at(self.reconciler.working_copy(), max_age, now)?;
        if expired.is_empty() {
            return Ok(());
        }
        self.state.stats.tasks_completed += expired.len() as u64;
        for task in &expired {
            let event = Event::new(
                EventKind::StaleLock,
                &self.config.project.name,
                format!("stale task lock cleared: {task}"),
            )
            .details(serde_json::json!({ "task": task }))
            .at(now);
            self.notify(event);
        }
        let message = format!("expire stale task locks: {}", expired.join(", "));
        self.reconciler
            .publish_lock_removals(&message)
            .context("publishing expired locks")?;
        Ok(())
    }

    /// Session accounting and failure detection from per-agent logs.
    fn scan_logs(&mut self, now: DateTime<Utc>) {
        let cooldown = chrono::Duration::from_std(self.config.daemon.error_cooldown())
            .unwrap_or(chrono::Duration::MAX);
        let mut alerts = Vec::new();

        for agent in &mut self.state.agents {
            let dir = self.layout.agent_log_dir(agent.id);
            let sessions = match session_logs(&dir) {
                Ok(s) if s.is_empty() => continue,
                Ok(s) => s,
                Err(e) => {
                    warn!(agent = agent.id, error = %e, "cannot read agent logs");
                    continue;
                }
            };

            // The newest session is still in progress.
            let finished = sessions.len() as u64 - 1;
            agent.sessions_completed = agent.sessions_completed.max(finished);
            if let Some(modified) = sessions.iter().map(|s| s.modified).max() {
                let modified = DateTime::<Utc>::from(modified);
                if modified > agent.last_activity {
                    agent.last_activity = modified;
                }
            }

            let cooling = self
                .last_error_notified
                .get(&agent.id)
                .is_some_and(|at| now - *at < cooldown);
            if cooling {
                continue;
            }
            let Some(latest) = sessions.last() else {
                continue;
            };
            match find_error_line(&latest.path) {
                Ok(Some(line)) => alerts.push((agent.id, agent.role.clone(), line)),
                Ok(None) => {}
                Err(e) => warn!(agent = agent.id, error = %e, "cannot read session log"),
            }
        }

        self.state.stats.total_sessions = self
            .state
            .agents
            .iter()
            .map(|a| a.sessions_completed)
            .sum();

        for (id, role, line) in alerts {
            self.last_error_notified.insert(id, now);
            let event = Event::new(
                EventKind::TestFailure,
                &self.config.project.name,
                format!("error detected in agent-{id} logs"),
            )
            .agent(id, &role)
            .details(serde_json::json!({ "line": line }))
            .at(now);
            self.notify(event);
        }
    }

    fn flush_commit_batch(&mut self, now: DateTime<Utc>) {
        let Some(started) = self.batch_started else {
            return;
        };
        let window = chrono::Duration::from_std(self.config.daemon.commit_batch_window())
            .unwrap_or(chrono::Duration::MAX);
        if self.pending_commits.is_empty() || now - started < window {
            return;
        }
        let commits = std::mem::take(&mut self.pending_commits);
        self.batch_started = None;
        let event = Event::new(
            EventKind::CommitsPushed,
            &self.config.project.name,
            format!("{} new commit(s) pushed", commits.len()),
        )
        .details(serde_json::json!({ "count": commits.len(), "commits": commits }))
        .at(now);
        self.notify(event);
    }

    fn persist(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.state.update_uptime(now);
        self.store.write(&self.state)?;
        self.store.write_heartbeat(now)
    }
}

struct SessionLog {
    number: u32,
    path: PathBuf,
    modified: SystemTime,
}

/// `session-<n>.log` files in `dir`, ordered by session number.
fn session_logs(dir: &Path) -> io::Result<Vec<SessionLog>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut logs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(number) = name
            .to_str()
            .and_then(|n| n.strip_prefix("session-"))
            .and_then(|n| n.strip_suffix(".log"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let modified = entry.metadata()?.modified()?;
        logs.push(SessionLog {
            number,
            path: entry.path(),
            modified,
        });
    }
    logs.sort_by_key(|l| l.number);
    Ok(logs)
}

/// First line matching the error marker among the last lines of `path`.
fn find_error_line(path: &Path) -> io::Result<Option<String>> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    Ok(lines[start..]
        .iter()
        .find(|l| error_marker().is_match(l))
        .map(|l| l.trim().to_string()))
}
