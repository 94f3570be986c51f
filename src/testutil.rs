//! Git fixtures shared by unit tests.

use std::fs;
use std::path::{Path, PathBuf};

use crate::git::Git;

/// Non-bare repository with one commit containing `README.md` and an empty
/// `current_tasks/`.
pub fn seeded_repo(dir: &Path) -> Git {
    fs::create_dir_all(dir).unwrap();
    let git = Git::new(dir);
    git.run(&["init", "-q"]).unwrap();
    git.set_identity("seed", "seed@example.com").unwrap();
    fs::write(dir.join("README.md"), "# demo\n").unwrap();
    fs::create_dir_all(dir.join("current_tasks")).unwrap();
    fs::write(dir.join("current_tasks/.gitkeep"), "").unwrap();
    git.run(&["add", "-A"]).unwrap();
    git.run(&["commit", "-q", "-m", "initial"]).unwrap();
    git
}

/// Bare repository cloned from a fresh seeded repo under `root`.
pub fn seeded_upstream(root: &Path) -> PathBuf {
    let seed = root.join("seed");
    seeded_repo(&seed);
    let upstream = root.join("upstream.git");
    Git::new(root)
        .run(&[
            "clone",
            "-q",
            "--bare",
            seed.to_str().unwrap(),
            upstream.to_str().unwrap(),
        ])
        .unwrap();
    upstream
}

/// Working clone of `upstream` with its own committer identity.
pub fn clone_as(upstream: &Path, dest: &Path, name: &str) -> Git {
    Git::new(dest.parent().unwrap())
        .run(&[
            "clone",
            "-q",
            upstream.to_str().unwrap(),
            dest.to_str().unwrap(),
        ])
        .unwrap();
    let git = Git::new(dest);
    git.set_identity(name, &format!("{name}@example.com"))
        .unwrap();
    git
}

/// Commit a file in `repo` and push it to origin.
pub fn commit_and_push(git: &Git, file: &str, contents: &str, message: &str) {
    let path = git.dir().join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
    git.run(&["add", file]).unwrap();
    git.run(&["commit", "-q", "-m", message]).unwrap();
    git.run(&["push", "-q", "origin", "HEAD"]).unwrap();
}
