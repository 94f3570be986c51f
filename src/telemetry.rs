//! Tracing subscriber setup.
//!
//! Interactive commands log human-readable lines to stderr. The daemon logs
//! JSON lines to stderr, which the launcher redirects into `daemon.log` and
//! tails for startup progress.

use tracing_subscriber::EnvFilter;

/// Filter directives, e.g. `METAMORPH_LOG=metamorph=debug`.
pub const LOG_ENV: &str = "METAMORPH_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cli,
    Daemon,
}

pub fn init(mode: Mode, verbose: bool) {
    let default = match (verbose, mode) {
        (true, _) => "debug",
        (false, Mode::Daemon) => "info",
        (false, Mode::Cli) => "warn",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // A second init (tests, re-entry) keeps the first subscriber.
    let _ = match mode {
        Mode::Daemon => builder.json().try_init(),
        Mode::Cli => builder.compact().try_init(),
    };
}

/// The `fields.message` of one JSON log line, if it has one.
pub fn message_of(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value
        .get("fields")?
        .get("message")?
        .as_str()
        .map(ToString::to_string)
}
