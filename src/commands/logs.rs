use std::io::{self, Write};

use anyhow::Context;
use clap::Args;

use crate::runtime::{ContainerRuntime, DockerCli};

#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Agent id (`3` or `agent-3`)
    #[arg(value_parser = parse_agent_id)]
    pub agent: u32,
    /// Number of lines from the end to show
    #[arg(short = 'n', long)]
    pub tail: Option<u32>,
    /// Keep streaming new output
    #[arg(short, long)]
    pub follow: bool,
}

impl LogsArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let (_, config) = super::load_project()?;
        let runtime = DockerCli::connect(&config.project.name, &config.docker)?;
        let mut stream = runtime.logs(self.agent, self.tail, self.follow)?;
        let mut stdout = io::stdout().lock();
        match io::copy(&mut stream, &mut stdout) {
            Ok(_) => {}
            // Reader went away (`metamorph logs 1 | head`).
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e).context("streaming container logs"),
        }
        stdout.flush().ok();
        Ok(())
    }
}

fn parse_agent_id(raw: &str) -> Result<u32, String> {
    raw.strip_prefix("agent-")
        .unwrap_or(raw)
        .parse::<u32>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| format!("invalid agent id {raw:?}: expected a positive number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_accept_bare_and_prefixed_forms() {
        assert_eq!(parse_agent_id("3"), Ok(3));
        assert_eq!(parse_agent_id("agent-12"), Ok(12));
        assert!(parse_agent_id("0").is_err());
        assert!(parse_agent_id("agent-x").is_err());
    }
}
