//! Keeping the upstream, the daemon's working copy, and the user's project
//! directory in step.
//!
//! Workers push to the bare upstream. The daemon reads from its own clone of
//! it and merges the upstream tip into the project directory so the user
//! sees agent output without running git themselves.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::git::{self, DAEMON_EMAIL, DAEMON_NAME, Git};
use crate::layout::{Layout, TASK_LOCK_DIR};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("merge failed, project directory left unchanged: {detail}")]
    MergeConflict { detail: String },

    #[error("{} is not a git repository", .0.display())]
    NotARepository(PathBuf),

    #[error(transparent)]
    Git(#[from] anyhow::Error),
}

/// Commit subjects brought in by one sync, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub subjects: Vec<String>,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subjects.is_empty() {
            return write!(f, "already up to date");
        }
        let noun = if self.subjects.len() == 1 { "commit" } else { "commits" };
        write!(f, "{} new {noun}:", self.subjects.len())?;
        for subject in &self.subjects {
            write!(f, "\n  - {subject}")?;
        }
        Ok(())
    }
}

/// The three repositories of one project.
#[derive(Debug, Clone)]
pub struct Reconciler {
    upstream: PathBuf,
    working_copy: PathBuf,
    project_dir: PathBuf,
}

impl Reconciler {
    pub fn new(layout: &Layout) -> Self {
        Self {
            upstream: layout.upstream(),
            working_copy: layout.working_copy(),
            project_dir: layout.root().to_path_buf(),
        }
    }

    pub fn upstream(&self) -> &Path {
        &self.upstream
    }

    pub fn working_copy(&self) -> &Path {
        &self.working_copy
    }

    /// Branch the upstream's HEAD points at.
    pub fn upstream_branch(&self) -> anyhow::Result<String> {
        Git::new(&self.upstream).current_branch()
    }

    /// Total commits reachable from the upstream HEAD.
    pub fn commit_count(&self) -> anyhow::Result<u64> {
        let out = Git::new(&self.upstream).run(&["rev-list", "--count", "HEAD"])?;
        out.parse()
            .with_context(|| format!("unexpected rev-list output {out:?}"))
    }

    /// Subjects of the latest `n` upstream commits, newest first, leaving out
    /// the daemon's own lock bookkeeping.
    pub fn recent_subjects(&self, n: u64) -> anyhow::Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = n.to_string();
        let out = Git::new(&self.upstream).run(&["log", "--format=%ae%x00%s", "-n", &limit])?;
        Ok(out
            .lines()
            .filter_map(|l| l.split_once('\0'))
            .filter(|(email, subject)| *email != DAEMON_EMAIL && !subject.trim().is_empty())
            .map(|(_, subject)| subject.to_string())
            .collect())
    }

    /// Clone the upstream into the working copy, or fetch and rebase it onto
    /// the upstream tip.
    pub fn sync_to_working_copy(&self) -> anyhow::Result<SyncSummary> {
        if !git::is_repository(&self.working_copy) {
            let parent = self
                .working_copy
                .parent()
                .context("working copy has no parent directory")?;
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
            clone(&self.upstream, &self.working_copy)?;
            let git = Git::new(&self.working_copy);
            git.set_identity(DAEMON_NAME, DAEMON_EMAIL)?;
            info!(path = %self.working_copy.display(), "cloned working copy");
            return Ok(SyncSummary {
                subjects: git.subjects("HEAD")?,
            });
        }

        let git = Git::new(&self.working_copy);
        let branch = self.upstream_branch()?;
        let before = git.head()?;
        git.run(&["fetch", "-q", "origin"])?;
        let onto = format!("origin/{branch}");
        if let Err(e) = git.run(&["rebase", "-q", &onto]) {
            let _ = git.output(&["rebase", "--abort"]);
            return Err(e.context("rebasing working copy"));
        }
        let after = git.head()?;
        if before == after {
            return Ok(SyncSummary::default());
        }
        let summary = SyncSummary {
            subjects: git.subjects(&format!("{before}..{after}"))?,
        };
        debug!(new = summary.len(), "working copy updated");
        Ok(summary)
    }

    /// Merge the upstream tip into the project directory's current branch.
    ///
    /// A failed merge is aborted before returning, so the project's HEAD and
    /// working tree are exactly as they were.
    pub fn sync_to_project_dir(&self) -> Result<SyncSummary, SyncError> {
        if !git::is_repository(&self.project_dir) {
            return Err(SyncError::NotARepository(self.project_dir.clone()));
        }
        let git = Git::new(&self.project_dir);
        let branch = self.upstream_branch()?;
        let upstream = self.upstream.to_string_lossy();
        let before = git.head()?;
        git.run(&["fetch", "-q", &upstream, &branch])?;

        let merge = git.output(&[
            "-c",
            &format!("user.name={DAEMON_NAME}"),
            "-c",
            &format!("user.email={DAEMON_EMAIL}"),
            "merge",
            "--no-edit",
            "FETCH_HEAD",
        ])?;
        if !merge.success() {
            if git.succeeds(&["rev-parse", "-q", "--verify", "MERGE_HEAD"]) {
                git.run(&["merge", "--abort"])?;
            }
            let detail = [merge.stdout.trim(), merge.stderr.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            warn!(project = %self.project_dir.display(), "merge from upstream failed");
            return Err(SyncError::MergeConflict { detail });
        }

        let after = git.head()?;
        if before == after {
            return Ok(SyncSummary::default());
        }
        Ok(SyncSummary {
            subjects: git.subjects(&format!("{before}..{after}"))?,
        })
    }

    /// Commit lock deletions in the working copy and push them upstream.
    ///
    /// A removal commit left behind by an earlier failed push is pushed too.
    /// Returns false when there was nothing to publish.
    pub fn publish_lock_removals(&self, message: &str) -> anyhow::Result<bool> {
        let git = Git::new(&self.working_copy);
        git.run(&["add", "-A", "--", TASK_LOCK_DIR])?;
        if git.has_staged_changes()? {
            git.run(&["commit", "-q", "-m", message])?;
        }
        let ahead: u64 = git
            .run(&["rev-list", "--count", "@{upstream}..HEAD"])?
            .parse()
            .context("parsing rev-list count")?;
        if ahead == 0 {
            return Ok(false);
        }
        let push = git.output(&["push", "-q", "origin", "HEAD"])?;
        if !push.success() {
            anyhow::bail!("pushing lock removals: {}", push.stderr.trim());
        }
        Ok(true)
    }
}

fn clone(src: &Path, dest: &Path) -> anyhow::Result<()> {
    let parent = dest.parent().unwrap_or(dest);
    Git::new(parent).run(&[
        "clone",
        "-q",
        &src.to_string_lossy(),
        &dest.to_string_lossy(),
    ])?;
    Ok(())
}

/// Make `layout.root()` a git repository holding `files`, then create the
/// bare upstream as a clone of it so both share history.
pub fn init_upstream(layout: &Layout, files: &[&str]) -> anyhow::Result<()> {
    let root = layout.root();
    let upstream = layout.upstream();
    if upstream.exists() {
        anyhow::bail!("upstream already exists at {}", upstream.display());
    }

    let git = Git::new(root);
    if !git::is_repository(root) {
        git.run(&["init", "-q"])?;
        info!(path = %root.display(), "initialized git repository");
    }

    let mut add = vec!["add", "--"];
    add.extend_from_slice(files);
    git.run(&add)?;

    let has_head = git.succeeds(&["rev-parse", "-q", "--verify", "HEAD"]);
    if !has_head || git.has_staged_changes()? {
        let identity = git.identity_overrides();
        let mut commit: Vec<&str> = identity.iter().map(String::as_str).collect();
        commit.extend(["commit", "-q", "-m", "Initialize metamorph project"]);
        git.run(&commit)?;
    }

    if let Some(parent) = upstream.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    Git::new(root).run(&[
        "clone",
        "-q",
        "--bare",
        &root.to_string_lossy(),
        &upstream.to_string_lossy(),
    ])?;
    info!(path = %upstream.display(), "created upstream repository");
    Ok(())
}

/// Clone the upstream for one agent and give it that agent's identity.
pub fn clone_for_agent(upstream: &Path, agent_id: u32, dest: &Path) -> anyhow::Result<()> {
    clone(upstream, dest)?;
    Git::new(dest).set_identity(
        &format!("agent-{agent_id}"),
        &format!("agent-{agent_id}@metamorph.local"),
    )
}
