use std::process::ExitCode;

use clap::{Parser, Subcommand};

use metamorph::commands::{self, init::InitArgs, logs::LogsArgs, notify::NotifyArgs};
use metamorph::commands::prompt::PromptArgs;
use metamorph::commands::{start::StartArgs, status::StatusArgs, stop::StopArgs};
use metamorph::commands::{sync::SyncArgs, tasks::TasksArgs};
use metamorph::error::ExitError;
use metamorph::telemetry::{self, Mode};

#[derive(Debug, Parser)]
#[command(
    name = "metamorph",
    version,
    about = "Run a fleet of coding agents that coordinate through git"
)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize a new metamorph project
    Init(InitArgs),
    /// Start the daemon and agents
    Start(StartArgs),
    /// Stop the daemon and agents
    Stop(StopArgs),
    /// Show daemon and agent status
    Status(StatusArgs),
    /// List or clear task locks
    Tasks(TasksArgs),
    /// Pull agent work into the project directory
    Sync(SyncArgs),
    /// Show an agent's container logs
    Logs(LogsArgs),
    /// Webhook notifications
    Notify(NotifyArgs),
    /// Show or edit the agent prompt
    Prompt(PromptArgs),
    /// Print the JSON Schema for metamorph.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Status(_) => "status",
            Self::Tasks(_) => "tasks",
            Self::Sync(_) => "sync",
            Self::Logs(_) => "logs",
            Self::Notify(_) => "notify",
            Self::Prompt(_) => "prompt",
            Self::Schema => "schema",
        }
    }

    const fn log_mode(&self) -> Mode {
        match self {
            Self::Start(args) if args.daemon_mode => Mode::Daemon,
            _ => Mode::Cli,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.command.log_mode(), cli.verbose);

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Init(args) => args.execute(),
        Commands::Start(args) => args.execute(),
        Commands::Stop(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Tasks(args) => args.execute(),
        Commands::Sync(args) => args.execute(),
        Commands::Logs(args) => args.execute(),
        Commands::Notify(args) => args.execute(),
        Commands::Prompt(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
