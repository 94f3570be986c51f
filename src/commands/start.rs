use std::path::PathBuf;

use clap::Args;

use crate::config::Config;
use crate::daemon::launch::{self, Overrides};
use crate::error::ExitError;
use crate::layout::Layout;
use crate::notify::WebhookNotifier;
use crate::process::{LivenessMarker, ProcessHandle};
use crate::runtime::{API_KEY_VAR, Credential, DockerCli, OAUTH_TOKEN_VAR};
use crate::state::StateStore;

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Number of agents (overrides agents.count)
    #[arg(short = 'n', long)]
    pub agents: Option<u32>,
    /// Model for every agent (overrides agents.model)
    #[arg(long)]
    pub model: Option<String>,
    /// Print what would be started without starting anything
    #[arg(long)]
    pub dry_run: bool,
    /// Run the supervisory loop in this process
    #[arg(long, hide = true)]
    pub daemon_mode: bool,
    /// Project root for daemon mode
    #[arg(long, hide = true, requires = "daemon_mode")]
    pub project_dir: Option<PathBuf>,
}

impl StartArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        if self.daemon_mode {
            return self.run_daemon();
        }

        let (layout, mut config) = super::load_project()?;
        super::require_upstream(&layout)?;
        self.overrides().apply(&mut config);
        config.validate()?;

        if Credential::from_env().is_none() {
            return Err(missing_credentials());
        }
        let marker = LivenessMarker::new(&layout.pid_file());
        if let Some(live) = marker.process().filter(ProcessHandle::is_alive) {
            return Err(ExitError::AlreadyRunning { pid: live.pid() }.into());
        }

        if self.dry_run {
            println!("Project:  {}", config.project.name);
            println!("Agents:   {}", config.agents.count);
            println!("Model:    {}", config.agents.model);
            let roles: Vec<String> = (1..=config.agents.count)
                .map(|id| config.agents.role_for(id))
                .collect();
            println!("Roles:    {}", roles.join(", "));
            println!("\n(dry run, no agents started)");
            return Ok(());
        }

        println!("Starting metamorph daemon for {:?}...", config.project.name);
        let pid = launch::start(&layout, &config, &self.overrides())?;
        println!("\nDaemon running (pid {pid})\n");

        match StateStore::new(&layout).read() {
            Ok(state) => {
                println!("{:<10}{:<14}STATUS", "AGENT", "ROLE");
                for agent in &state.agents {
                    println!(
                        "{:<10}{:<14}{}",
                        format!("agent-{}", agent.id),
                        agent.role,
                        agent.status
                    );
                }
            }
            Err(e) => println!("Daemon started, but could not read status: {e:#}"),
        }
        println!("\nUse 'metamorph status' to monitor, 'metamorph stop' to stop.");
        Ok(())
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            agents: self.agents,
            model: self.model.clone(),
        }
    }

    /// The detached child spawned by `launch::start`.
    fn run_daemon(&self) -> anyhow::Result<()> {
        let root = match &self.project_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let layout = Layout::new(&root);
        let mut config = Config::load(&layout.config_file())?;
        self.overrides().apply(&mut config);
        config.validate()?;

        let credential = Credential::from_env().ok_or_else(missing_credentials)?;
        let runtime = DockerCli::connect(&config.project.name, &config.docker)?;
        let notifier = WebhookNotifier::from_config(&config.notifications.webhook_url);
        launch::run(&layout, config, credential, Box::new(runtime), notifier)
    }
}

fn missing_credentials() -> anyhow::Error {
    ExitError::Config(format!(
        "no credentials found: set {OAUTH_TOKEN_VAR} (Claude Pro/Max) or {API_KEY_VAR}"
    ))
    .into()
}
