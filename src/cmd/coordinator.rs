use super::{write_treefile, RunSetup};
use crate::reports;
use clap::Args;
use phyloforge::config::Config;
use phyloforge::error::ForgeResult;
use phyloforge::optimizer::TreeSearch;
use phyloforge::sync::{SyncCoordinator, TcpTransport};
use std::time::{Duration, Instant};

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    #[command(flatten)]
    pub config: Config,

    #[arg(long, default_value = "127.0.0.1:7878")]
    pub listen: String,

    /// Worker processes expected to connect (ranks 1..=N).
    #[arg(short = 'w', long)]
    pub workers: usize,

    /// Seconds to wait for every worker to connect.
    #[arg(long, default_value_t = 120)]
    pub accept_timeout: u64,

    #[arg(long, default_value_t = 5)]
    pub top: usize,
}

pub fn run(args: &CoordinatorArgs, setup: &RunSetup) -> ForgeResult<()> {
    let start = Instant::now();
    let nprocs = args.workers + 1;
    println!(
        "📡 Waiting for {} workers on {} (seed {})",
        args.workers, args.listen, setup.seed
    );
    let transport = TcpTransport::listen(
        &args.listen,
        args.workers,
        Duration::from_secs(args.accept_timeout),
    )?;
    let sync = SyncCoordinator::new(
        Box::new(transport),
        nprocs,
        setup.ctx.config.search.pop_size,
        &setup.ctx.config.sync,
    );
    let mut search = TreeSearch::new(
        setup.context(0, nprocs),
        Some(sync),
        setup.checkpoint_store(0),
        setup.seed,
    );
    search.run_search_loop()?;

    let treefile = write_treefile(&search, setup)?;
    println!("💾 Best tree written to {}", treefile.display());
    reports::print_run_summary(&search, &treefile, start.elapsed(), args.top);
    Ok(())
}
