//! Thin wrapper over the `git` CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::subprocess::{RunOutput, Tool};

/// Per-call bound on git operations, including network fetch/push.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity used for commits the daemon makes itself.
pub const DAEMON_NAME: &str = "metamorph";
pub const DAEMON_EMAIL: &str = "metamorph@localhost";

/// Git invocations rooted at one directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tool(&self, args: &[&str]) -> Tool {
        Tool::new("git")
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(GIT_TIMEOUT)
    }

    /// Run git and return trimmed stdout, failing on non-zero exit.
    pub fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = self
            .tool(args)
            .run_ok()
            .with_context(|| format!("git {} (in {})", args.join(" "), self.dir.display()))?;
        Ok(output.stdout.trim().to_string())
    }

    /// Run git and return the raw output regardless of exit status.
    pub fn output(&self, args: &[&str]) -> anyhow::Result<RunOutput> {
        self.tool(args)
            .run()
            .with_context(|| format!("git {} (in {})", args.join(" "), self.dir.display()))
    }

    /// True if the command exits zero. Spawn failures count as false.
    pub fn succeeds(&self, args: &[&str]) -> bool {
        self.output(args).is_ok_and(|o| o.success())
    }

    pub fn head(&self) -> anyhow::Result<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    /// Branch HEAD points at. Works in bare and non-bare repositories.
    pub fn current_branch(&self) -> anyhow::Result<String> {
        self.run(&["symbolic-ref", "--short", "HEAD"])
    }

    /// Commit subjects in `range`, newest first, merges excluded.
    pub fn subjects(&self, range: &str) -> anyhow::Result<Vec<String>> {
        let out = self.run(&["log", "--no-merges", "--format=%s", range])?;
        Ok(lines(&out))
    }

    /// Whether the index differs from HEAD.
    pub fn has_staged_changes(&self) -> anyhow::Result<bool> {
        let out = self.output(&["diff", "--cached", "--quiet"])?;
        match out.exit_code {
            0 => Ok(false),
            1 => Ok(true),
            code => anyhow::bail!("git diff --cached failed (exit {code}): {}", out.stderr.trim()),
        }
    }

    /// Extra `-c` flags supplying the daemon identity when the repository has none.
    pub fn identity_overrides(&self) -> Vec<String> {
        let configured = self
            .output(&["config", "user.email"])
            .is_ok_and(|o| o.success() && !o.stdout.trim().is_empty());
        if configured {
            Vec::new()
        } else {
            vec![
                "-c".into(),
                format!("user.name={DAEMON_NAME}"),
                "-c".into(),
                format!("user.email={DAEMON_EMAIL}"),
            ]
        }
    }

    pub fn set_identity(&self, name: &str, email: &str) -> anyhow::Result<()> {
        self.run(&["config", "user.name", name])?;
        self.run(&["config", "user.email", email])?;
        Ok(())
    }
}

/// Whether a failed push means the remote moved underneath us.
///
/// Covers the non-fast-forward rejection and the ref-lock failure git reports
/// when two pushes hit the same ref at the same instant.
pub fn is_push_rejection(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "rejected",
        "conflict",
        "non-fast-forward",
        "fetch first",
        "failed to update ref",
        "cannot lock ref",
    ];
    let lower = stderr.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

pub fn is_repository(dir: &Path) -> bool {
    dir.join(".git").exists()
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_push_rejections() {
        assert!(is_push_rejection(
            " ! [rejected]        main -> main (fetch first)\nerror: failed to push some refs"
        ));
        assert!(is_push_rejection(
            " ! [remote rejected] main -> main (failed to update ref)"
        ));
        assert!(is_push_rejection(
            "error: cannot lock ref 'refs/heads/main': is at 1a2b but expected 3c4d"
        ));
        assert!(!is_push_rejection(
            "fatal: could not read from remote repository."
        ));
        assert!(!is_push_rejection("Permission denied (publickey)."));
    }

    #[test]
    fn subjects_and_branch_in_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new(dir.path());
        git.run(&["init", "-q"]).unwrap();
        git.set_identity("t", "t@example.com").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        git.run(&["add", "a.txt"]).unwrap();
        assert!(git.has_staged_changes().unwrap());
        git.run(&["commit", "-q", "-m", "first"]).unwrap();
        assert!(!git.has_staged_changes().unwrap());

        assert!(!git.current_branch().unwrap().is_empty());
        assert_eq!(git.subjects("HEAD").unwrap(), vec!["first"]);
        assert!(git.identity_overrides().is_empty());
    }

    #[test]
    fn run_failure_names_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = Git::new(dir.path()).run(&["rev-parse", "HEAD"]).unwrap_err();
        assert!(format!("{err:#}").contains("git rev-parse HEAD"));
    }
}
