use chrono::{DateTime, Local, Utc};
use clap::Args;
use dialoguer::Confirm;

use super::format_duration;
use crate::locks::{self, TaskLock};
use crate::reconcile::Reconciler;

#[derive(Debug, Args)]
pub struct TasksArgs {
    /// Clear task locks older than the stale threshold
    #[arg(long)]
    pub clear: bool,
    /// Skip the confirmation prompt for --clear
    #[arg(long, short = 'y', requires = "clear")]
    pub yes: bool,
    /// Output locks as JSON
    #[arg(long, conflicts_with = "clear")]
    pub json: bool,
}

impl TasksArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let (layout, config) = super::load_project()?;
        super::require_upstream(&layout)?;
        let reconciler = Reconciler::new(&layout);
        reconciler.sync_to_working_copy()?;

        let held = locks::list(reconciler.working_copy())?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&held)?);
            return Ok(());
        }
        if held.is_empty() {
            println!("No active task locks.");
            return Ok(());
        }

        let now = Utc::now();
        if !self.clear {
            print_table(&held, now);
            return Ok(());
        }

        let max_age = config.daemon.stale_lock_max_age();
        println!("Found {} active task lock(s):", held.len());
        for lock in &held {
            println!(
                "  {} (agent-{}, {})",
                lock.name,
                lock.agent_id,
                format_duration(age_secs(lock, now))
            );
        }
        let prompt = format!(
            "Clear task locks older than {}?",
            format_duration(max_age.as_secs())
        );
        if !self.yes && !Confirm::new().with_prompt(prompt).default(false).interact()? {
            println!("Cancelled.");
            return Ok(());
        }

        let cleared = locks::expire_at(reconciler.working_copy(), max_age, now)?;
        if cleared.is_empty() {
            println!(
                "No stale tasks found (all locks are younger than {}).",
                format_duration(max_age.as_secs())
            );
            return Ok(());
        }
        let message = format!("clear stale task locks: {}", cleared.join(", "));
        reconciler.publish_lock_removals(&message)?;
        println!("Cleared {} stale task(s): {}", cleared.len(), cleared.join(", "));
        Ok(())
    }
}

fn age_secs(lock: &TaskLock, now: DateTime<Utc>) -> u64 {
    u64::try_from(lock.age(now).num_seconds()).unwrap_or(0)
}

fn print_table(held: &[TaskLock], now: DateTime<Utc>) {
    let width = held.iter().map(|l| l.name.len()).max().unwrap_or(4).max(4) + 2;
    println!("{:<width$}{:<10}{:<21}DURATION", "TASK", "AGENT", "CLAIMED AT");
    for lock in held {
        println!(
            "{:<width$}{:<10}{:<21}{}",
            lock.name,
            format!("agent-{}", lock.agent_id),
            lock.claimed_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            format_duration(age_secs(lock, now))
        );
    }
}
