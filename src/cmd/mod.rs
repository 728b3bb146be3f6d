pub mod coordinator;
pub mod inspect;
pub mod search;
pub mod worker;

use clap::Args;
use phyloforge::alignment::Alignment;
use phyloforge::candidates::parse_candidate;
use phyloforge::checkpoint::CheckpointStore;
use phyloforge::config::Config;
use phyloforge::error::{ForgeError, ForgeResult};
use phyloforge::job::RunFingerprint;
use phyloforge::optimizer::{SearchContext, TreeSearch};
use phyloforge::oracle::ParsimonyOracle;
use phyloforge::topology::{ConstraintTopology, PartitionScheme};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Input files shared by every command that runs a search.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Alignment in relaxed PHYLIP or FASTA format.
    #[arg(global = true, short = 's', long)]
    pub alignment: Option<PathBuf>,

    /// Partition definitions (`name = start-end` per line).
    #[arg(global = true, short = 'p', long)]
    pub partitions: Option<PathBuf>,

    /// Constraint tree in Newick format, labelled by taxon name.
    #[arg(global = true, short = 'g', long)]
    pub constraint: Option<PathBuf>,

    /// JSON config file; explicit command-line flags override it.
    #[arg(global = true, long)]
    pub config_file: Option<PathBuf>,

    /// Output prefix; defaults to the alignment path.
    #[arg(global = true, long)]
    pub prefix: Option<PathBuf>,

    #[arg(global = true, long)]
    pub seed: Option<u64>,

    #[arg(global = true, long, default_value_t = false)]
    pub no_checkpoint: bool,
}

/// Loaded inputs plus the identity of the run.
pub struct RunSetup {
    pub ctx: SearchContext,
    pub prefix: PathBuf,
    pub fingerprint: RunFingerprint,
    pub seed: u64,
    pub checkpoint: bool,
}

impl RunSetup {
    pub fn load(inputs: &InputArgs, config: Config) -> ForgeResult<Self> {
        let aln_path = inputs
            .alignment
            .as_ref()
            .ok_or_else(|| ForgeError::Config("--alignment is required".into()))?;
        println!("📂 Loading alignment: {}", aln_path.display());
        let alignment = Alignment::from_file(aln_path)?;
        println!(
            "   {} taxa, {} sites ({})",
            alignment.taxon_count(),
            alignment.site_count(),
            alignment.data_type()
        );
        config.validate_for_taxa(alignment.taxon_count())?;

        let partitions = match &inputs.partitions {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    ForgeError::Config(format!(
                        "Failed to read partitions '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                let scheme = PartitionScheme::parse(&text, &alignment)?;
                println!("🧩 Partition scheme: {}", scheme.capability());
                scheme
            }
            None => PartitionScheme::Single,
        };

        let constraint = match &inputs.constraint {
            Some(path) => {
                let c = ConstraintTopology::from_file(path, alignment.names())?;
                println!(
                    "🔒 Constraint: {} taxa, {} splits",
                    c.taxa().count(),
                    c.split_count()
                );
                Some(c)
            }
            None => None,
        };

        let fingerprint =
            RunFingerprint::from_parts(&config, alignment.names(), &alignment.digest());
        let oracle = ParsimonyOracle::new(&alignment, partitions.clone());
        info!(
            "Parsimony oracle ready: {} patterns, run {}",
            oracle.pattern_count(),
            fingerprint.short()
        );

        let ctx = SearchContext::builder()
            .oracle(Arc::new(oracle))
            .names(alignment.names().to_vec())
            .config(config)
            .constraint(constraint)
            .partitions(partitions)
            .build();

        Ok(Self {
            ctx,
            prefix: inputs.prefix.clone().unwrap_or_else(|| aln_path.clone()),
            fingerprint,
            seed: inputs.seed.unwrap_or_else(|| fastrand::u64(..)),
            checkpoint: !inputs.no_checkpoint,
        })
    }

    pub fn checkpoint_store(&self, rank: usize) -> Option<CheckpointStore> {
        self.checkpoint
            .then(|| CheckpointStore::new(&self.prefix, rank, &self.fingerprint.hash))
    }

    /// Context for `rank` in a run of `nprocs` processes.
    pub fn context(&self, rank: usize, nprocs: usize) -> SearchContext {
        let mut ctx = self.ctx.for_rank(rank);
        ctx.nprocs = nprocs;
        ctx
    }
}

/// Writes `<prefix>.treefile` with names, lengths and bootstrap supports.
pub fn write_treefile(search: &TreeSearch, setup: &RunSetup) -> ForgeResult<PathBuf> {
    let best = search
        .best_tree_strings(1)
        .into_iter()
        .next()
        .ok_or_else(|| ForgeError::Invariant("no tree to write".into()))?;
    let topo = parse_candidate(&best, search.context().leaf_count())
        .ok_or_else(|| ForgeError::Newick(format!("cannot re-read best tree {}", best)))?;
    let supports = search.bootstrap().map(|b| b.support_for(&topo));
    let newick = topo.named_tree_string(&search.context().names, supports.as_ref());
    let path = PathBuf::from(format!("{}.treefile", setup.prefix.display()));
    fs::write(&path, format!("{}\n", newick))?;
    Ok(path)
}

/// Builds the rayon pool once per process.
pub fn init_thread_pool(config: &Config) {
    let threads = config.thread_count();
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        warn!("⚠️  Could not size the thread pool: {}", e);
    } else {
        info!("🧵 Evaluating branches on {} threads", threads);
    }
}
