use clap::Args;

use crate::error::ExitError;
use crate::notify::{Event, EventKind, Notifier, WebhookNotifier};

#[derive(Debug, Args)]
pub struct NotifyArgs {
    /// Send a test event to the configured webhook
    #[arg(long)]
    pub test: bool,
}

impl NotifyArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let (_, config) = super::load_project()?;
        let url = config.notifications.webhook_url.trim();
        if url.is_empty() {
            return Err(ExitError::Config(
                "no webhook URL configured ([notifications] webhook_url in metamorph.toml)".into(),
            )
            .into());
        }
        if !self.test {
            println!("Webhook: {url}");
            println!("Use --test to send a test event.");
            return Ok(());
        }

        println!("Sending test notification to {url}...");
        let event = Event::new(
            EventKind::Test,
            &config.project.name,
            "Test notification from metamorph",
        );
        WebhookNotifier::new(url).send(&event)?;
        println!("Notification delivered.");
        Ok(())
    }
}
