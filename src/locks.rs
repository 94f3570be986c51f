//! Task locks coordinated through git.
//!
//! A lock is a file `current_tasks/<task>.lock` containing
//! `agent-<id> <RFC3339 timestamp>`. Claiming commits the file and pushes it;
//! the remote accepts exactly one of several concurrent pushes, so a rejected
//! push means another agent won. There is no coordinator process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::git::{self, Git};
use crate::layout::TASK_LOCK_DIR;

pub const LOCK_SUFFIX: &str = ".lock";

/// A parsed lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskLock {
    pub name: String,
    pub agent_id: u32,
    pub claimed_at: DateTime<Utc>,
}

impl TaskLock {
    /// The on-disk record.
    pub fn record(&self) -> String {
        format!(
            "agent-{} {}\n",
            self.agent_id,
            self.claimed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// Parse the content of `<name>.lock`.
    pub fn parse(name: &str, content: &str) -> Result<Self, LockError> {
        let malformed = |reason: &str| LockError::Malformed {
            task: name.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = content.split_whitespace().collect();
        let [owner, stamp] = fields.as_slice() else {
            return Err(malformed(&format!(
                "expected 2 fields, found {}",
                fields.len()
            )));
        };
        let agent_id = owner
            .strip_prefix("agent-")
            .ok_or_else(|| malformed(&format!("owner {owner:?} lacks agent- prefix")))?
            .parse::<u32>()
            .map_err(|_| malformed(&format!("owner {owner:?} has no numeric id")))?;
        let claimed_at = DateTime::parse_from_rfc3339(stamp)
            .map_err(|e| malformed(&format!("bad timestamp {stamp:?}: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            name: name.to_string(),
            agent_id,
            claimed_at,
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.claimed_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Won,
    Lost,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("task {task:?} is held by agent-{owner}, not agent-{agent}")]
    NotOwner { task: String, agent: u32, owner: u32 },

    #[error("no lock held for task {task:?}")]
    Missing { task: String },

    #[error("malformed lock for task {task:?}: {reason}")]
    Malformed { task: String, reason: String },

    #[error("invalid task name {0:?}")]
    InvalidName(String),

    #[error("push failed for task {task:?}: {message}")]
    Push { task: String, message: String },

    #[error(transparent)]
    Git(#[from] anyhow::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(context: String) -> impl FnOnce(io::Error) -> LockError {
    move |source| LockError::Io { context, source }
}

/// Repository-relative path of a task's lock file.
pub fn lock_path(task: &str) -> String {
    format!("{TASK_LOCK_DIR}/{task}{LOCK_SUFFIX}")
}

fn validate_name(task: &str) -> Result<(), LockError> {
    let ok = !task.is_empty()
        && task != "."
        && task != ".."
        && !task.starts_with('.')
        && task
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(LockError::InvalidName(task.to_string()))
    }
}

/// Try to claim `task` for `agent_id` from the working clone at `repo`.
///
/// Returns `Lost` if the lock already exists locally or the push was rejected
/// because the remote moved. After a lost race the local claim commit is
/// discarded and the clone is rebased onto the remote.
pub fn claim(repo: &Path, task: &str, agent_id: u32) -> Result<ClaimOutcome, LockError> {
    claim_at(repo, task, agent_id, Utc::now())
}

pub fn claim_at(
    repo: &Path,
    task: &str,
    agent_id: u32,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, LockError> {
    validate_name(task)?;
    let rel = lock_path(task);
    let path = repo.join(&rel);
    if path.exists() {
        debug!(task, agent_id, "lock already present locally");
        return Ok(ClaimOutcome::Lost);
    }

    let lock = TaskLock {
        name: task.to_string(),
        agent_id,
        claimed_at: now,
    };
    let dir = repo.join(TASK_LOCK_DIR);
    fs::create_dir_all(&dir).map_err(io_err(format!("creating {}", dir.display())))?;
    fs::write(&path, lock.record()).map_err(io_err(format!("writing {}", path.display())))?;

    let git = Git::new(repo);
    let message = format!("claim task {task} for agent-{agent_id}");
    let committed = git
        .run(&["add", "--", &rel])
        .and_then(|_| git.run(&["commit", "-q", "-m", &message, "--", &rel]));
    if let Err(e) = committed {
        warn!(task, agent_id, error = %format!("{e:#}"), "claim commit failed");
        discard_uncommitted_claim(&git, &rel)?;
        return Err(e.into());
    }

    let push = git.output(&["push", "-q", "origin", "HEAD"])?;
    if push.success() {
        info!(task, agent_id, "claimed task");
        return Ok(ClaimOutcome::Won);
    }

    let rejected = git::is_push_rejection(&push.stderr);
    discard_claim_commit(&git, &rel)?;
    if rejected {
        info!(task, agent_id, "lost claim race");
        resync(&git)?;
        Ok(ClaimOutcome::Lost)
    } else {
        Err(LockError::Push {
            task: task.to_string(),
            message: push.stderr.trim().to_string(),
        })
    }
}

/// Undo the claim commit while keeping any uncommitted work in the clone.
fn discard_claim_commit(git: &Git, rel: &str) -> Result<(), LockError> {
    git.run(&["reset", "-q", "--soft", "HEAD~1"])?;
    git.run(&["rm", "-q", "--cached", "--", rel])?;
    remove_lock_file(git, rel)
}

/// Remove a lock file that was written (and maybe staged) but never committed.
fn discard_uncommitted_claim(git: &Git, rel: &str) -> Result<(), LockError> {
    git.run(&["rm", "-q", "--cached", "--ignore-unmatch", "--", rel])?;
    remove_lock_file(git, rel)
}

fn remove_lock_file(git: &Git, rel: &str) -> Result<(), LockError> {
    let path = git.dir().join(rel);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(format!("removing {}", path.display()))(e)),
    }
}

fn resync(git: &Git) -> Result<(), LockError> {
    let branch = git.current_branch()?;
    git.run(&["pull", "-q", "--rebase", "--autostash", "origin", &branch])?;
    Ok(())
}

/// Remove `task`'s lock if `agent_id` holds it, then commit and push.
///
/// A failed push is returned to the caller, not retried.
pub fn release(repo: &Path, task: &str, agent_id: u32) -> Result<(), LockError> {
    validate_name(task)?;
    let rel = lock_path(task);
    let path = repo.join(&rel);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(LockError::Missing {
                task: task.to_string(),
            });
        }
        Err(e) => return Err(io_err(format!("reading {}", path.display()))(e)),
    };
    let lock = TaskLock::parse(task, &content)?;
    if lock.agent_id != agent_id {
        return Err(LockError::NotOwner {
            task: task.to_string(),
            agent: agent_id,
            owner: lock.agent_id,
        });
    }

    let git = Git::new(repo);
    git.run(&["rm", "-q", "--", &rel])?;
    let message = format!("release task {task} from agent-{agent_id}");
    git.run(&["commit", "-q", "-m", &message, "--", &rel])?;
    let push = git.output(&["push", "-q", "origin", "HEAD"])?;
    if !push.success() {
        return Err(LockError::Push {
            task: task.to_string(),
            message: push.stderr.trim().to_string(),
        });
    }
    info!(task, agent_id, "released task");
    Ok(())
}

/// Every lock in `repo`'s lock directory, sorted by task name.
///
/// Files without the `.lock` suffix are ignored. A missing directory means no
/// locks. A malformed record fails the whole listing.
pub fn list(repo: &Path) -> Result<Vec<TaskLock>, LockError> {
    let dir = repo.join(TASK_LOCK_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(format!("reading {}", dir.display()))(e)),
    };

    let mut locks = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(format!("reading {}", dir.display())))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(LOCK_SUFFIX))
        else {
            continue;
        };
        let content =
            fs::read_to_string(&path).map_err(io_err(format!("reading {}", path.display())))?;
        locks.push(TaskLock::parse(name, &content)?);
    }
    locks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(locks)
}

/// Delete locks older than `max_age` from the local copy. Returns the names
/// removed. Publishing the deletions is the caller's job.
pub fn expire(repo: &Path, max_age: Duration) -> Result<Vec<String>, LockError> {
    expire_at(repo, max_age, Utc::now())
}

/// [`expire`] with an explicit clock. A lock exactly `max_age` old is kept.
pub fn expire_at(
    repo: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<String>, LockError> {
    let max_age = chrono::Duration::from_std(max_age)
        .map_err(|e| LockError::Git(anyhow::anyhow!("max age out of range: {e}")))?;

    let mut removed = Vec::new();
    for lock in list(repo)? {
        if lock.age(now) <= max_age {
            continue;
        }
        let path = lock_file(repo, &lock.name);
        fs::remove_file(&path).map_err(io_err(format!("removing {}", path.display())))?;
        warn!(
            task = %lock.name,
            agent_id = lock.agent_id,
            age_secs = lock.age(now).num_seconds(),
            "expired stale lock"
        );
        removed.push(lock.name);
    }
    Ok(removed)
}

fn lock_file(repo: &Path, task: &str) -> PathBuf {
    repo.join(lock_path(task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn write_lock(repo: &Path, task: &str, agent_id: u32, at: DateTime<Utc>) {
        let lock = TaskLock {
            name: task.to_string(),
            agent_id,
            claimed_at: at,
        };
        let dir = repo.join(TASK_LOCK_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(lock_file(repo, task), lock.record()).unwrap();
    }

    #[test]
    fn record_format() {
        let lock = TaskLock {
            name: "parser".into(),
            agent_id: 7,
            claimed_at: ts("2024-01-01T00:00:00Z"),
        };
        assert_eq!(lock.record(), "agent-7 2024-01-01T00:00:00Z\n");
        assert_eq!(TaskLock::parse("parser", &lock.record()).unwrap(), lock);
    }

    #[test]
    fn parse_rejects_malformed_records() {
        for bad in [
            "",
            "agent-1",
            "agent-1 2024-01-01T00:00:00Z extra",
            "bot-1 2024-01-01T00:00:00Z",
            "agent-x 2024-01-01T00:00:00Z",
            "agent-1 yesterday",
        ] {
            let err = TaskLock::parse("t", bad).unwrap_err();
            assert!(matches!(err, LockError::Malformed { .. }), "{bad:?}");
        }
    }

    #[test]
    fn rejects_path_like_task_names() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["", "..", "a/b", ".hidden", "with space"] {
            assert!(matches!(
                claim(dir.path(), bad, 1),
                Err(LockError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn list_is_sorted_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let at = ts("2024-01-01T00:00:00Z");
        write_lock(dir.path(), "zeta", 2, at);
        write_lock(dir.path(), "alpha", 1, at);
        fs::write(dir.path().join("current_tasks/.gitkeep"), "").unwrap();
        fs::write(dir.path().join("current_tasks/notes.txt"), "x").unwrap();

        let first = list(dir.path()).unwrap();
        let names: Vec<_> = first.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
        assert_eq!(list(dir.path()).unwrap(), first);
    }

    #[test]
    fn list_fails_on_malformed_lock() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(TASK_LOCK_DIR)).unwrap();
        fs::write(dir.path().join("current_tasks/bad.lock"), "garbage").unwrap();
        assert!(matches!(
            list(dir.path()),
            Err(LockError::Malformed { task, .. }) if task == "bad"
        ));
    }

    #[test]
    fn expiry_threshold_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let now = ts("2024-01-01T02:00:00Z");
        write_lock(dir.path(), "exact", 1, ts("2024-01-01T00:00:00Z"));
        write_lock(dir.path(), "older", 2, ts("2024-01-01T00:00:00Z") - chrono::Duration::seconds(1));

        let removed = expire_at(dir.path(), Duration::from_secs(7200), now).unwrap();
        assert_eq!(removed, ["older"]);
        let left: Vec<_> = list(dir.path()).unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(left, ["exact"]);
    }

    #[test]
    fn expiry_clears_only_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let now = ts("2024-06-01T12:00:00Z");
        write_lock(dir.path(), "stale", 1, now - chrono::Duration::hours(3));
        write_lock(dir.path(), "fresh", 2, now - chrono::Duration::minutes(5));

        let removed = expire_at(dir.path(), Duration::from_secs(2 * 3600), now).unwrap();
        assert_eq!(removed, ["stale"]);
        let left = list(dir.path()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "fresh");
        assert_eq!(left[0].agent_id, 2);
    }

    #[test]
    fn expiry_on_empty_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert!(expire(dir.path(), Duration::from_secs(1)).unwrap().is_empty());
    }

    #[test]
    fn second_claimant_loses_race() {
        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let a = testutil::clone_as(&upstream, &root.path().join("a"), "agent-1");
        let b = testutil::clone_as(&upstream, &root.path().join("b"), "agent-2");

        assert_eq!(claim(a.dir(), "fix-parser", 1).unwrap(), ClaimOutcome::Won);
        assert_eq!(claim(b.dir(), "fix-parser", 2).unwrap(), ClaimOutcome::Lost);

        // The loser is now in sync with the winner's claim.
        let locks = list(b.dir()).unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].name, "fix-parser");
        assert_eq!(locks[0].agent_id, 1);

        let upstream_log = Git::new(&upstream).subjects("HEAD").unwrap();
        assert_eq!(upstream_log[0], "claim task fix-parser for agent-1");
        assert!(!upstream_log.iter().any(|s| s.contains("agent-2")));
    }

    #[test]
    fn lost_race_keeps_uncommitted_work() {
        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let a = testutil::clone_as(&upstream, &root.path().join("a"), "agent-1");
        let b = testutil::clone_as(&upstream, &root.path().join("b"), "agent-2");

        fs::write(b.dir().join("README.md"), "# edited by agent-2\n").unwrap();
        fs::write(b.dir().join("scratch.txt"), "wip").unwrap();

        assert_eq!(claim(a.dir(), "t", 1).unwrap(), ClaimOutcome::Won);
        // b has not seen a's lock yet, so this goes all the way to push.
        assert_eq!(claim(b.dir(), "t", 2).unwrap(), ClaimOutcome::Lost);

        assert_eq!(
            fs::read_to_string(b.dir().join("README.md")).unwrap(),
            "# edited by agent-2\n"
        );
        assert!(b.dir().join("scratch.txt").exists());
    }

    #[test]
    fn failed_claim_commit_leaves_no_lock_behind() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let a = testutil::clone_as(&upstream, &root.path().join("a"), "agent-1");

        let hook = a.dir().join(".git/hooks/pre-commit");
        fs::create_dir_all(hook.parent().unwrap()).unwrap();
        fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(claim(a.dir(), "fix-parser", 1).is_err());
        assert!(!lock_file(a.dir(), "fix-parser").exists());
        assert!(list(a.dir()).unwrap().is_empty());
        assert!(!a.has_staged_changes().unwrap());

        fs::remove_file(&hook).unwrap();
        assert_eq!(claim(a.dir(), "fix-parser", 1).unwrap(), ClaimOutcome::Won);
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let clones: Vec<Git> = (1..=4)
            .map(|i| {
                testutil::clone_as(&upstream, &root.path().join(format!("c{i}")), &format!("agent-{i}"))
            })
            .collect();

        let outcomes: Vec<ClaimOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = clones
                .iter()
                .zip(1u32..)
                .map(|(git, id)| s.spawn(move || claim(git.dir(), "shared", id).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = outcomes.iter().filter(|o| **o == ClaimOutcome::Won).count();
        assert_eq!(winners, 1, "{outcomes:?}");

        let check = testutil::clone_as(&upstream, &root.path().join("check"), "check");
        let locks = list(check.dir()).unwrap();
        assert_eq!(locks.len(), 1);
        let winner_id = outcomes
            .iter()
            .zip(1u32..)
            .find(|(o, _)| **o == ClaimOutcome::Won)
            .map(|(_, id)| id)
            .unwrap();
        assert_eq!(locks[0].agent_id, winner_id);
    }

    #[test]
    fn claim_is_lost_when_lock_exists_locally() {
        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let a = testutil::clone_as(&upstream, &root.path().join("a"), "agent-1");

        assert_eq!(claim(a.dir(), "t", 1).unwrap(), ClaimOutcome::Won);
        let head = a.head().unwrap();
        assert_eq!(claim(a.dir(), "t", 1).unwrap(), ClaimOutcome::Lost);
        assert_eq!(a.head().unwrap(), head);
    }

    #[test]
    fn release_checks_ownership() {
        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let a = testutil::clone_as(&upstream, &root.path().join("a"), "agent-1");

        assert!(matches!(
            release(a.dir(), "t", 1),
            Err(LockError::Missing { .. })
        ));

        assert_eq!(claim(a.dir(), "t", 1).unwrap(), ClaimOutcome::Won);
        assert!(matches!(
            release(a.dir(), "t", 2),
            Err(LockError::NotOwner { owner: 1, agent: 2, .. })
        ));
        assert!(a.dir().join(lock_path("t")).exists());

        release(a.dir(), "t", 1).unwrap();
        assert!(list(a.dir()).unwrap().is_empty());

        let b = testutil::clone_as(&upstream, &root.path().join("b"), "agent-2");
        assert!(list(b.dir()).unwrap().is_empty());
        assert_eq!(claim(b.dir(), "t", 2).unwrap(), ClaimOutcome::Won);
    }

    #[test]
    fn release_surfaces_rejected_push() {
        let root = tempfile::tempdir().unwrap();
        let upstream = testutil::seeded_upstream(root.path());
        let a = testutil::clone_as(&upstream, &root.path().join("a"), "agent-1");
        let b = testutil::clone_as(&upstream, &root.path().join("b"), "agent-2");

        assert_eq!(claim(a.dir(), "t", 1).unwrap(), ClaimOutcome::Won);
        testutil::commit_and_push(&b, "other.txt", "x", "unrelated work");

        assert!(matches!(
            release(a.dir(), "t", 1),
            Err(LockError::Push { .. })
        ));
    }
}
