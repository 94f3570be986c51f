use clap::Args;

use crate::reconcile::Reconciler;

#[derive(Debug, Args)]
pub struct SyncArgs {}

impl SyncArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let layout = super::current_project()?;
        super::require_upstream(&layout)?;
        let reconciler = Reconciler::new(&layout);

        let pulled = reconciler.sync_to_working_copy()?;
        println!("Working copy: {pulled}");
        let merged = reconciler.sync_to_project_dir()?;
        println!("Project directory: {merged}");
        Ok(())
    }
}
