//! Process liveness probing and signalling.
//!
//! The daemon records its pid in a marker file; other invocations use the
//! marker to decide whether a previously-started daemon is still alive. This
//! is a local-machine check only.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// A handle on an OS process that can be probed and signalled.
pub trait ProcessHandle {
    fn pid(&self) -> u32;

    /// True if the process exists and we are allowed to signal it.
    fn is_alive(&self) -> bool;

    /// Ask the process to shut down gracefully.
    fn terminate(&self) -> anyhow::Result<()>;

    /// Force the process to exit.
    fn kill(&self) -> anyhow::Result<()>;
}

/// Unix process addressed by pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixProcess {
    pid: u32,
}

impl UnixProcess {
    pub const fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn current() -> Self {
        Self::new(std::process::id())
    }

    fn raw(&self) -> Option<Pid> {
        // pid 0 and negative pids address process groups; never signal those.
        match i32::try_from(self.pid) {
            Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
            _ => None,
        }
    }

    fn send(&self, sig: Signal) -> anyhow::Result<()> {
        let pid = self
            .raw()
            .with_context(|| format!("invalid pid {}", self.pid))?;
        signal::kill(pid, sig).with_context(|| format!("sending {sig} to pid {}", self.pid))
    }
}

impl ProcessHandle for UnixProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.raw().is_some_and(|pid| signal::kill(pid, None).is_ok())
    }

    fn terminate(&self) -> anyhow::Result<()> {
        self.send(Signal::SIGTERM)
    }

    fn kill(&self) -> anyhow::Result<()> {
        self.send(Signal::SIGKILL)
    }
}

/// File recording the daemon's pid.
#[derive(Debug, Clone)]
pub struct LivenessMarker {
    path: PathBuf,
}

impl LivenessMarker {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current process as the live daemon.
    pub fn write_current(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, std::process::id().to_string())
            .with_context(|| format!("writing {}", self.path.display()))
    }

    /// Pid recorded in the marker, if the marker exists and parses.
    pub fn read_pid(&self) -> anyhow::Result<u32> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        raw.trim()
            .parse::<u32>()
            .with_context(|| format!("invalid pid in {}", self.path.display()))
    }

    pub fn process(&self) -> Option<UnixProcess> {
        self.read_pid().ok().map(UnixProcess::new)
    }

    /// Marker exists AND its pid is a live, signalable process.
    pub fn is_alive(&self) -> bool {
        self.process().is_some_and(|p| p.is_alive())
    }

    /// Remove the marker. Missing is fine.
    pub fn remove(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(UnixProcess::current().is_alive());
    }

    #[test]
    fn reaped_child_is_not_alive() {
        assert!(!UnixProcess::new(test_support::dead_pid()).is_alive());
    }

    #[test]
    fn zero_pid_is_never_alive() {
        assert!(!UnixProcess::new(0).is_alive());
        assert!(UnixProcess::new(0).terminate().is_err());
    }

    #[test]
    fn terminate_stops_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let handle = UnixProcess::new(child.id());
        assert!(handle.is_alive());
        handle.terminate().unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let marker = LivenessMarker::new(&dir.path().join(".metamorph/daemon.pid"));
        assert!(!marker.is_alive());

        marker.write_current().unwrap();
        assert_eq!(marker.read_pid().unwrap(), std::process::id());
        assert!(marker.is_alive());

        marker.remove().unwrap();
        assert!(!marker.path().exists());
        marker.remove().unwrap();
    }

    #[test]
    fn marker_with_dead_pid_is_not_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, test_support::dead_pid().to_string()).unwrap();
        assert!(!LivenessMarker::new(&path).is_alive());
    }

    #[test]
    fn marker_with_garbage_is_not_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "not-a-pid").unwrap();
        let marker = LivenessMarker::new(&path);
        assert!(marker.read_pid().is_err());
        assert!(!marker.is_alive());
    }
}
