use clap::Args;

use super::format_duration;
use crate::daemon::launch;
use crate::reconcile::Reconciler;
use crate::state::StateStore;

#[derive(Debug, Args)]
pub struct StopArgs {}

impl StopArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let (layout, config) = super::load_project()?;
        let store = StateStore::new(&layout);
        // Read before stopping: the daemon's final snapshot only marks it stopped.
        let before = store.read().ok();

        println!("Stopping metamorph daemon...");
        launch::stop(&layout, config.daemon.shutdown_timeout())?;

        let reconciler = Reconciler::new(&layout);
        if let Err(e) = reconciler.sync_to_working_copy() {
            println!("Warning: failed to sync working copy: {e:#}");
        }
        match reconciler.sync_to_project_dir() {
            Ok(summary) if !summary.is_empty() => println!("\nSynced {summary}"),
            Ok(_) => {}
            Err(e) => println!("Warning: failed to sync to project: {e:#}"),
        }
        println!("\nDaemon stopped.");

        let stats = store.read().ok().or(before).map(|s| s.stats);
        if let Some(stats) = stats {
            println!("\nSession summary:");
            println!("  Sessions:        {}", stats.total_sessions);
            println!("  Commits:         {}", stats.total_commits);
            println!("  Tasks completed: {}", stats.tasks_completed);
            println!("  Uptime:          {}", format_duration(stats.uptime_seconds));
        }
        Ok(())
    }
}
