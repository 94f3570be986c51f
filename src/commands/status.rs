use std::io::IsTerminal;

use chrono::{DateTime, Local, Utc};
use clap::Args;
use serde::Serialize;

use super::format_duration;
use crate::state::{DaemonState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    /// Shorthand for --format json
    #[arg(long, conflicts_with = "format")]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: DaemonState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let layout = super::current_project()?;
        let store = StateStore::new(&layout);
        let format = self.output_format();

        if !store.exists() {
            match format {
                OutputFormat::Json => println!("null"),
                _ => println!("Daemon is not running."),
            }
            return Ok(());
        }
        let report = StatusReport {
            state: store.read()?,
            heartbeat: store.read_heartbeat(),
        };

        match format {
            OutputFormat::Pretty => print_pretty(&report, Utc::now()),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }

    fn output_format(&self) -> OutputFormat {
        if self.json {
            return OutputFormat::Json;
        }
        self.format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        })
    }
}

fn print_pretty(report: &StatusReport, now: DateTime<Utc>) {
    let state = &report.state;
    println!("Project:  {}", state.project_name);
    println!("Status:   {}", state.status);
    println!("Uptime:   {}", format_duration(state.stats.uptime_seconds));
    println!(
        "Started:  {}",
        state.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(beat) = report.heartbeat {
        println!("Last tick: {}", relative(beat, now));
    }
    println!();

    if !state.agents.is_empty() {
        println!(
            "{:<10}{:<12}{:<10}{:<28}LAST ACTIVITY",
            "AGENT", "ROLE", "STATUS", "TASK"
        );
        for agent in &state.agents {
            println!(
                "{:<10}{:<12}{:<10}{:<28}{}",
                format!("agent-{}", agent.id),
                agent.role,
                agent.status.as_str(),
                agent.current_task.as_deref().unwrap_or("-"),
                relative(agent.last_activity, now)
            );
        }
        println!();
    }
    println!(
        "Commits: {}  Sessions: {}  Tasks completed: {}",
        state.stats.total_commits, state.stats.total_sessions, state.stats.tasks_completed
    );
}

fn print_text(report: &StatusReport) {
    let state = &report.state;
    println!(
        "daemon  project={}  status={}  uptime={}",
        state.project_name, state.status, state.stats.uptime_seconds
    );
    for agent in &state.agents {
        println!(
            "agent  id={}  role={}  status={}  task={}  sessions={}",
            agent.id,
            agent.role,
            agent.status,
            agent.current_task.as_deref().unwrap_or("-"),
            agent.sessions_completed
        );
    }
    println!(
        "stats  commits={}  sessions={}  tasks_completed={}",
        state.stats.total_commits, state.stats.total_sessions, state.stats.tasks_completed
    );
}

/// `now - then` as "42s ago", "5m ago", "3h ago".
fn relative(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}
