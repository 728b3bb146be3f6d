use super::RunSetup;
use clap::Args;
use phyloforge::config::Config;
use phyloforge::error::{ForgeError, ForgeResult};
use phyloforge::optimizer::TreeSearch;
use phyloforge::sync::{SyncCoordinator, TcpTransport};
use std::time::Duration;

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub config: Config,

    #[arg(long, default_value = "127.0.0.1:7878")]
    pub connect: String,

    /// This worker's rank, from 1 to `--workers`.
    #[arg(short = 'r', long)]
    pub rank: usize,

    /// Total workers in the run, as given to the coordinator.
    #[arg(short = 'w', long)]
    pub workers: usize,

    /// Seconds to keep retrying the coordinator.
    #[arg(long, default_value_t = 120)]
    pub connect_timeout: u64,
}

pub fn run(args: &WorkerArgs, setup: &RunSetup) -> ForgeResult<()> {
    if args.rank == 0 || args.rank > args.workers {
        return Err(ForgeError::Config(format!(
            "--rank must be in 1..={}, got {}",
            args.workers, args.rank
        )));
    }
    let nprocs = args.workers + 1;
    println!(
        "🔌 Worker {} of {} connecting to {}",
        args.rank, args.workers, args.connect
    );
    let transport = TcpTransport::connect(
        &args.connect,
        args.rank,
        Duration::from_secs(args.connect_timeout),
    )?;
    let sync = SyncCoordinator::new(
        Box::new(transport),
        nprocs,
        setup.ctx.config.search.pop_size,
        &setup.ctx.config.sync,
    );
    let mut search = TreeSearch::new(
        setup.context(args.rank, nprocs),
        Some(sync),
        setup.checkpoint_store(args.rank),
        setup.seed,
    );
    let best = search.run_search_loop()?;
    println!(
        "✅ Worker {} done after {} iterations, best {:.4}",
        args.rank,
        search.iterations(),
        best
    );
    Ok(())
}
