use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;

use crate::config::Config;
use crate::error::ExitError;
use crate::layout::{self, Layout};
use crate::reconcile;

const DEFAULT_AGENT_PROMPT: &str = include_str!("../../assets/AGENT_PROMPT.md");
const DEFAULT_PROGRESS: &str = include_str!("../../assets/PROGRESS.md");
const GITIGNORE: &str = ".metamorph/\nagent_logs/\n";
const LOCK_DIR_KEEP: &str = "current_tasks/.gitkeep";

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Directory to initialize (created if missing)
    #[arg(default_value = ".")]
    pub dir: PathBuf,
}

impl InitArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let root = self
            .dir
            .canonicalize()
            .with_context(|| format!("resolving {}", self.dir.display()))?;
        let name = project_name(&root)?;
        let layout = Layout::new(&root);

        if layout.config_file().exists() {
            return Err(ExitError::Config(format!(
                "{} already exists in {}",
                layout::CONFIG_FILE,
                root.display()
            ))
            .into());
        }

        scaffold(&layout, &name)?;
        reconcile::init_upstream(
            &layout,
            &[
                layout::CONFIG_FILE,
                layout::AGENT_PROMPT_FILE,
                layout::PROGRESS_FILE,
                LOCK_DIR_KEEP,
                ".gitignore",
            ],
        )
        .context("initializing upstream repository")?;
        println!("  Initialized upstream repo");

        println!("\nProject {name:?} initialized.\n");
        println!("Next steps:");
        println!("  1. Review and customize {}", layout::CONFIG_FILE);
        println!("  2. Edit {} with project-specific instructions", layout::AGENT_PROMPT_FILE);
        println!("  3. Set credentials (pick one):");
        println!("       export CLAUDE_CODE_OAUTH_TOKEN=...   # Claude Pro/Max subscription");
        println!("       export ANTHROPIC_API_KEY=sk-...       # Anthropic API key");
        println!("  4. Start agents: metamorph start");
        Ok(())
    }
}

fn project_name(root: &Path) -> anyhow::Result<String> {
    root.file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| ExitError::Config(format!("cannot name a project at {}", root.display())).into())
}

/// Write config, agent-facing files, and the visible directories.
fn scaffold(layout: &Layout, name: &str) -> anyhow::Result<()> {
    let root = layout.root();
    let config = Config::starter(name).to_toml()?;
    write_new(&layout.config_file(), &config)?;
    write_new(&layout.agent_prompt(), DEFAULT_AGENT_PROMPT)?;
    write_new(&root.join(layout::PROGRESS_FILE), DEFAULT_PROGRESS)?;

    for dir in [layout::TASK_LOCK_DIR, layout::AGENT_LOG_DIR] {
        let path = root.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
        println!("  Created {dir}/");
    }
    fs::write(root.join(LOCK_DIR_KEEP), "")
        .with_context(|| format!("writing {LOCK_DIR_KEEP}"))?;

    let gitignore = root.join(".gitignore");
    let existing = fs::read_to_string(&gitignore).unwrap_or_default();
    let missing: String = GITIGNORE
        .lines()
        .filter(|entry| !existing.lines().any(|l| l.trim() == *entry))
        .map(|entry| format!("{entry}\n"))
        .collect();
    if !missing.is_empty() {
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&missing);
        fs::write(&gitignore, content).context("writing .gitignore")?;
        println!("  Updated .gitignore");
    }
    Ok(())
}

/// Write `contents` unless the file already exists.
fn write_new(path: &Path, contents: &str) -> anyhow::Result<()> {
    let name = path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    if path.exists() {
        println!("  Kept existing {name}");
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    println!("  Created {name}");
    Ok(())
}
