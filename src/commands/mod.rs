pub mod init;
pub mod logs;
pub mod notify;
pub mod prompt;
pub mod schema;
pub mod start;
pub mod status;
pub mod stop;
pub mod sync;
pub mod tasks;

use std::path::PathBuf;

use anyhow::Context;

use crate::config::Config;
use crate::error::ExitError;
use crate::layout::{self, Layout};

/// Locate the enclosing project from the current directory.
pub fn current_project() -> anyhow::Result<Layout> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let root = layout::find_project_root(&cwd).ok_or_else(|| {
        ExitError::Config(format!(
            "no {} found in {} or any parent directory (run 'metamorph init' first)",
            layout::CONFIG_FILE,
            cwd.display()
        ))
    })?;
    Ok(Layout::new(&root))
}

/// Project layout plus its validated config.
pub fn load_project() -> anyhow::Result<(Layout, Config)> {
    let layout = current_project()?;
    let config = Config::load(&layout.config_file())?;
    Ok((layout, config))
}

/// Fail unless `init` has created the upstream repository.
pub fn require_upstream(layout: &Layout) -> anyhow::Result<PathBuf> {
    let upstream = layout.upstream();
    if !upstream.is_dir() {
        return Err(ExitError::Config(format!(
            "project not initialized: {} not found (run 'metamorph init' first)",
            layout::UPSTREAM_DIR
        ))
        .into());
    }
    Ok(upstream)
}

/// `3725` -> `1h 2m 5s`
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_drop_leading_zero_units() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }
}
