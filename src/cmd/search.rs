use super::{write_treefile, RunSetup};
use crate::reports;
use clap::Args;
use phyloforge::config::Config;
use phyloforge::error::ForgeResult;
use phyloforge::optimizer::TreeSearch;
use phyloforge::sync::{ChannelTransport, SyncCoordinator};
use std::thread;
use std::time::Instant;
use tracing::{error, info};

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    #[command(flatten)]
    pub config: Config,

    /// Search processes run as threads of this process; rank 0 coordinates.
    #[arg(short = 'w', long, default_value_t = 1)]
    pub workers: usize,

    /// Candidate trees shown in the final report.
    #[arg(long, default_value_t = 5)]
    pub top: usize,
}

pub fn run(args: &SearchArgs, setup: &RunSetup) -> ForgeResult<()> {
    let start = Instant::now();
    let nprocs = args.workers.max(1);

    let search = if nprocs == 1 {
        println!("🔥 Running a single search process (seed {})", setup.seed);
        let mut search = TreeSearch::new(
            setup.context(0, 1),
            None,
            setup.checkpoint_store(0),
            setup.seed,
        );
        search.run_search_loop()?;
        search
    } else {
        println!(
            "🔥 Running {} search processes in lock-step (seed {})",
            nprocs, setup.seed
        );
        run_in_process(setup, nprocs)?
    };

    let treefile = write_treefile(&search, setup)?;
    println!("💾 Best tree written to {}", treefile.display());
    reports::print_run_summary(&search, &treefile, start.elapsed(), args.top);
    Ok(())
}

fn run_in_process(setup: &RunSetup, nprocs: usize) -> ForgeResult<TreeSearch> {
    let mut endpoints = ChannelTransport::mesh(nprocs)?;
    let coordinator_end = endpoints.remove(0);
    let sync_params = &setup.ctx.config.sync;
    let pop_size = setup.ctx.config.search.pop_size;

    thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, transport)| {
                let rank = i + 1;
                scope.spawn(move || {
                    let sync =
                        SyncCoordinator::new(Box::new(transport), nprocs, pop_size, sync_params);
                    let mut search = TreeSearch::new(
                        setup.context(rank, nprocs),
                        Some(sync),
                        setup.checkpoint_store(rank),
                        setup.seed,
                    );
                    search.run_search_loop()
                })
            })
            .collect();

        let sync =
            SyncCoordinator::new(Box::new(coordinator_end), nprocs, pop_size, sync_params);
        let mut search = TreeSearch::new(
            setup.context(0, nprocs),
            Some(sync),
            setup.checkpoint_store(0),
            setup.seed,
        );
        let result = search.run_search_loop();

        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(score)) => info!("Worker {} finished with {:.4}", i + 1, score),
                Ok(Err(e)) => error!("❌ Worker {} failed: {}", i + 1, e),
                Err(_) => error!("❌ Worker {} panicked", i + 1),
            }
        }

        result.map(|_| search)
    })
}
