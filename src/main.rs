use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use phyloforge::config::Config;
use phyloforge::error::ForgeResult;
use std::process;
use tracing::Level;

mod cmd;
mod reports;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    inputs: cmd::InputArgs,

    #[arg(global = true, long, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Single-machine search, optionally with in-process workers.
    Search(cmd::search::SearchArgs),
    /// Rank 0 of a distributed search, listening for workers over TCP.
    Coordinator(cmd::coordinator::CoordinatorArgs),
    /// Rank 1.. of a distributed search.
    Worker(cmd::worker::WorkerArgs),
    /// Summarises a checkpoint file.
    Inspect(cmd::inspect::InspectArgs),
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// File config first, explicit flags on top.
fn resolve_config(
    cli_config: &Config,
    inputs: &cmd::InputArgs,
    sub_matches: &ArgMatches,
) -> ForgeResult<Config> {
    let config = match &inputs.config_file {
        Some(path) => {
            println!("⚙️  Loading config from: {}", path.display());
            let mut file_config = Config::load_from_file(path)?;
            file_config.merge_from_cli(cli_config, sub_matches);
            file_config
        }
        None => cli_config.clone(),
    };
    config.validate()?;
    Ok(config)
}

fn fail(context: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("\n❌ {}:", context);
    eprintln!("   {}", e);
    process::exit(1);
}

fn main() {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    init_logging(cli.debug);

    if let Commands::Inspect(args) = &cli.command {
        if let Err(e) = cmd::inspect::run(args) {
            fail("CANNOT READ CHECKPOINT", e);
        }
        return;
    }

    println!("\n🚀 Initializing PhyloForge...");

    let (cli_config, name) = match &cli.command {
        Commands::Search(args) => (&args.config, "search"),
        Commands::Coordinator(args) => (&args.config, "coordinator"),
        Commands::Worker(args) => (&args.config, "worker"),
        Commands::Inspect(_) => return,
    };
    let Some(sub_matches) = matches.subcommand_matches(name) else {
        fail("INTERNAL ERROR", format!("no matches for '{}'", name));
    };

    let config = resolve_config(cli_config, &cli.inputs, sub_matches)
        .unwrap_or_else(|e| fail("INVALID CONFIGURATION", e));
    cmd::init_thread_pool(&config);

    let setup = cmd::RunSetup::load(&cli.inputs, config)
        .unwrap_or_else(|e| fail("FATAL ERROR LOADING INPUTS", e));

    let result = match &cli.command {
        Commands::Search(args) => cmd::search::run(args, &setup),
        Commands::Coordinator(args) => cmd::coordinator::run(args, &setup),
        Commands::Worker(args) => cmd::worker::run(args, &setup),
        Commands::Inspect(_) => Ok(()),
    };
    if let Err(e) = result {
        fail("SEARCH FAILED", e);
    }
}
