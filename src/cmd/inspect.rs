use crate::reports;
use clap::Args;
use phyloforge::checkpoint::CheckpointStore;
use phyloforge::error::ForgeResult;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Checkpoint file written by a search (`<prefix>.ckp.json`).
    pub checkpoint: PathBuf,

    #[arg(long, default_value_t = 5)]
    pub top: usize,
}

pub fn run(args: &InspectArgs) -> ForgeResult<()> {
    println!("\n🔎 === CHECKPOINT AUDIT === 🔎");
    let state = CheckpointStore::read(&args.checkpoint)?;
    reports::print_checkpoint_summary(&args.checkpoint, &state, args.top);
    Ok(())
}
