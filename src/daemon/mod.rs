//! The supervisory daemon.
//!
//! One long-lived loop owns the [`DaemonState`]. Every `monitor_interval` it
//! runs a tick (see `monitor.rs`); a termination signal ends the loop after
//! the tick in progress, then the fleet is stopped and a final snapshot is
//! written.

pub mod launch;
mod monitor;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::layout::Layout;
use crate::notify::{Event, Notifier};
use crate::process::LivenessMarker;
use crate::reconcile::Reconciler;
use crate::runtime::{ContainerRuntime, Credential, GitIdentity, WorkerOpts};
use crate::state::{AgentState, AgentStatus, DaemonState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Daemon {
    layout: Layout,
    config: Config,
    credential: Credential,
    runtime: Box<dyn ContainerRuntime>,
    notifier: Arc<dyn Notifier>,
    store: StateStore,
    reconciler: Reconciler,
    marker: LivenessMarker,
    phase: Phase,
    state: DaemonState,

    /// Upstream commit count seen by the previous tick.
    prev_commit_count: Option<u64>,
    pending_commits: Vec<String>,
    batch_started: Option<DateTime<Utc>>,
    last_error_notified: HashMap<u32, DateTime<Utc>>,
    deliveries: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(
        layout: Layout,
        config: Config,
        credential: Credential,
        runtime: Box<dyn ContainerRuntime>,
        notifier: Arc<dyn Notifier>,
        now: DateTime<Utc>,
    ) -> Self {
        let state = DaemonState::new(&config.project.name, now);
        Self {
            store: StateStore::new(&layout),
            reconciler: Reconciler::new(&layout),
            marker: LivenessMarker::new(&layout.pid_file()),
            layout,
            config,
            credential,
            runtime,
            notifier,
            phase: Phase::Starting,
            state,
            prev_commit_count: None,
            pending_commits: Vec::new(),
            batch_started: None,
            last_error_notified: HashMap::new(),
            deliveries: Vec::new(),
        }
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn state(&self) -> &DaemonState {
        &self.state
    }

    fn worker_opts(&self, id: u32, role: &str) -> WorkerOpts {
        WorkerOpts {
            project_dir: self.layout.root().to_path_buf(),
            id,
            role: role.to_string(),
            model: self.config.agents.model.clone(),
            credential: self.credential.clone(),
            git_identity: GitIdentity {
                name: self.config.git.author_name.clone(),
                email: self.config.git.author_email.clone(),
            },
        }
    }

    /// Build the image, launch every worker, and write the first snapshot.
    ///
    /// Any failure here is fatal: the daemon never runs with a partial fleet.
    pub fn start_fleet(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        info!("building agent image");
        self.runtime
            .build_image(&self.layout)
            .context("building agent image")?;

        self.state.agents.clear();
        for id in 1..=self.config.agents.count {
            let role = self.config.agents.role_for(id);
            info!(agent = id, role = %role, "starting agents");
            let container = self
                .runtime
                .start_worker(&self.worker_opts(id, &role))
                .with_context(|| format!("starting agent-{id}"))?;
            let mut agent = AgentState::new(id, &role, now);
            agent.container_id = container;
            agent.status = AgentStatus::Running;
            self.state.agents.push(agent);
        }

        if let Err(e) = self.reconciler.sync_to_working_copy() {
            warn!(error = %format!("{e:#}"), "initial working copy sync failed");
        }
        match self.reconciler.commit_count() {
            Ok(count) => {
                self.prev_commit_count = Some(count);
                self.state.stats.total_commits = count;
            }
            Err(e) => warn!(error = %format!("{e:#}"), "could not count upstream commits"),
        }

        self.state.update_uptime(now);
        self.store
            .write(&self.state)
            .context("writing initial state")?;
        self.phase = Phase::Running;
        info!(agents = self.state.agents.len(), "daemon running");
        Ok(())
    }

    /// Tick until `shutdown` fires or its sender goes away, then shut down.
    pub fn run(&mut self, shutdown: &Receiver<()>) -> anyhow::Result<()> {
        let interval = self.config.daemon.monitor_interval();
        loop {
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => self.tick(Utc::now()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("termination requested");
        self.shutdown(Utc::now())
    }

    /// Stop every worker, reconcile once more, and persist the final state.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.phase = Phase::ShuttingDown;
        info!("stopping agents");
        if let Err(e) = self.runtime.stop_all_workers() {
            warn!(error = %format!("{e:#}"), "some agents did not stop cleanly");
        }
        if let Err(e) = self.sync_repos() {
            warn!(error = %format!("{e:#}"), "final sync failed");
        }

        self.state.mark_stopped();
        self.state.update_uptime(now);
        let persisted = self.store.write(&self.state);
        self.flush_notifications();
        self.marker.remove()?;
        self.phase = Phase::Stopped;
        info!("daemon stopped");
        persisted
    }

    /// Deliver `event` on a background thread.
    fn notify(&mut self, event: Event) {
        let notifier = Arc::clone(&self.notifier);
        self.deliveries.push(thread::spawn(move || {
            if let Err(e) = notifier.send(&event) {
                warn!(event = ?event.event, error = %format!("{e:#}"), "notification failed");
            }
        }));
    }

    /// Wait for every in-flight notification.
    pub fn flush_notifications(&mut self) {
        for handle in self.deliveries.drain(..) {
            if handle.join().is_err() {
                warn!("notification thread panicked");
            }
        }
    }

    /// Bring the working copy and the project directory up to the upstream tip.
    fn sync_repos(&self) -> anyhow::Result<()> {
        let pulled = self
            .reconciler
            .sync_to_working_copy()
            .context("syncing working copy")?;
        if !pulled.is_empty() {
            info!(commits = pulled.len(), "working copy updated");
        }
        let merged = self
            .reconciler
            .sync_to_project_dir()
            .context("merging into project directory")?;
        if !merged.is_empty() {
            info!(commits = merged.len(), "merged agent work into project directory");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::fakes::daemon;
    use super::*;
    use crate::notify::EventKind;
    use crate::state::DaemonStatus;

    #[test]
    fn start_fleet_launches_every_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, runtime, _) = daemon(dir.path(), 3);
        assert_eq!(d.phase(), Phase::Starting);

        d.start_fleet(Utc::now()).unwrap();
        assert_eq!(d.phase(), Phase::Running);
        assert_eq!(runtime.calls(), ["build", "start 1", "start 2", "start 3"]);

        let roles: Vec<_> = d.state().agents.iter().map(|a| a.role.as_str()).collect();
        assert_eq!(roles, ["developer", "tester", "developer"]);

        let persisted: DaemonState =
            serde_json::from_str(&std::fs::read_to_string(Layout::new(dir.path()).state_file()).unwrap())
                .unwrap();
        assert_eq!(persisted.status, DaemonStatus::Running);
        assert_eq!(persisted.agents.len(), 3);
    }

    #[test]
    fn start_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, runtime, _) = daemon(dir.path(), 2);
        *runtime.fail_start.lock().unwrap() = true;
        let err = d.start_fleet(Utc::now()).unwrap_err();
        assert!(format!("{err:#}").contains("agent-1"));
        assert_eq!(d.phase(), Phase::Starting);
        assert!(!Layout::new(dir.path()).state_file().exists());
    }

    #[test]
    fn panicking_delivery_does_not_break_flush() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, _, notifier) = daemon(dir.path(), 1);
        let event = || Event::new(EventKind::StaleLock, "demo", "stale task lock cleared: x");

        *notifier.panic_on_send.lock().unwrap() = true;
        d.notify(event());
        d.flush_notifications();
        assert!(d.deliveries.is_empty());
        assert!(notifier.kinds().is_empty());

        *notifier.panic_on_send.lock().unwrap() = false;
        d.notify(event());
        d.flush_notifications();
        assert_eq!(notifier.kinds(), [EventKind::StaleLock]);
    }

    #[test]
    fn run_stops_on_signal_and_persists_stopped_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let (mut d, runtime, _) = daemon(dir.path(), 2);
        LivenessMarker::new(&layout.pid_file()).write_current().unwrap();
        d.start_fleet(Utc::now()).unwrap();

        let (tx, rx) = mpsc::channel();
        tx.send(()).unwrap();
        d.run(&rx).unwrap();

        assert_eq!(d.phase(), Phase::Stopped);
        assert!(runtime.calls().contains(&"stop-all".to_string()));
        assert!(!layout.pid_file().exists());

        let state = StateStore::new(&layout).read().unwrap();
        assert_eq!(state.status, DaemonStatus::Stopped);
        assert!(state.agents.iter().all(|a| a.status == AgentStatus::Stopped));
    }
}
