use crate::error::{ForgeError, ForgeResult};
use crate::optimizer::perturbation::PerturbationKind;
use crate::optimizer::search::StartTree;
use crate::stop_rule::StopCondition;
use clap::{parser::ValueSource, ArgMatches, Args};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Args, Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[command(flatten)]
    pub search: SearchParams,
    #[command(flatten)]
    pub perturb: PerturbParams,
    #[command(flatten)]
    pub stop: StopParams,
    #[command(flatten)]
    pub bootstrap: BootstrapParams,
    #[command(flatten)]
    pub sync: SyncParams,
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Starting trees generated for the initial population.
    #[arg(long, default_value_t = 100)]
    pub num_init_trees: usize,
    /// Best starting trees that get a full NNI pass.
    #[arg(long, default_value_t = 20)]
    pub num_nni_trees: usize,
    /// Candidate set capacity during the main loop.
    #[arg(long, default_value_t = 5)]
    pub num_support_trees: usize,
    /// Perturbations start from a random tree among this many best.
    #[arg(long, default_value_t = 5)]
    pub pop_size: usize,
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub speed_nni: bool,
    #[arg(long, default_value_t = 0.001)]
    pub loglh_epsilon: f64,
    /// Batch rollbacks allowed per NNI call before falling back to single moves.
    #[arg(long, default_value_t = 3)]
    pub max_rollbacks: usize,
    #[arg(long, value_enum, default_value_t = StartTree::Parsimony)]
    pub start_tree: StartTree,
    /// Rayon threads for branch evaluation; 0 uses every core.
    #[arg(long, default_value_t = 0)]
    pub threads: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            num_init_trees: 100,
            num_nni_trees: 20,
            num_support_trees: 5,
            pop_size: 5,
            speed_nni: true,
            loglh_epsilon: 0.001,
            max_rollbacks: 3,
            start_tree: StartTree::Parsimony,
            threads: 0,
        }
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbParams {
    #[arg(long, value_enum, default_value_t = PerturbationKind::Iqp)]
    pub perturbation: PerturbationKind,
    /// Fraction of internal branches shaken by random NNI.
    #[arg(long, default_value_t = 0.5)]
    pub strength: f64,
    #[arg(long, default_value_t = false)]
    pub tabu: bool,
    #[arg(long, default_value_t = false)]
    pub fix_stable_splits: bool,
    #[arg(long, default_value_t = 0.9)]
    pub stable_threshold: f64,
    #[arg(long, default_value_t = 4)]
    pub k_represent: usize,
    /// Starting IQP deletion count; 0 derives it from the number of taxa.
    #[arg(long, default_value_t = 0)]
    pub k_delete_min: usize,
}

impl Default for PerturbParams {
    fn default() -> Self {
        Self {
            perturbation: PerturbationKind::Iqp,
            strength: 0.5,
            tabu: false,
            fix_stable_splits: false,
            stable_threshold: 0.9,
            k_represent: 4,
            k_delete_min: 0,
        }
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopParams {
    #[arg(long = "stop", value_enum, default_value_t = StopCondition::UnsuccessfulIterations)]
    pub condition: StopCondition,
    #[arg(long, default_value_t = 1000)]
    pub max_iterations: usize,
    #[arg(long, default_value_t = 100)]
    pub min_iterations: usize,
    /// Iterations run in fixed-iteration mode.
    #[arg(long, default_value_t = 100)]
    pub required_iterations: usize,
    #[arg(long, default_value_t = 100)]
    pub unsuccessful_iterations: usize,
    #[arg(long)]
    pub max_time_secs: Option<u64>,
}

impl Default for StopParams {
    fn default() -> Self {
        Self {
            condition: StopCondition::UnsuccessfulIterations,
            max_iterations: 1000,
            min_iterations: 100,
            required_iterations: 100,
            unsuccessful_iterations: 100,
            max_time_secs: None,
        }
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapParams {
    /// Bootstrap replicates accumulated during the search; 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub replicates: usize,
    #[arg(long, default_value_t = 0.5)]
    pub ufboot_epsilon: f64,
    #[arg(long, default_value_t = 100)]
    pub step_iterations: usize,
    #[arg(long, default_value_t = 0.99)]
    pub min_correlation: f64,
    #[arg(long, default_value_t = 64)]
    pub max_snapshots: usize,
    #[arg(long, default_value_t = 20_240_611)]
    pub bootstrap_seed: u64,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            replicates: 0,
            ufboot_epsilon: 0.5,
            step_iterations: 100,
            min_correlation: 0.99,
            max_snapshots: 64,
            bootstrap_seed: 20_240_611,
        }
    }
}

impl BootstrapParams {
    pub fn enabled(&self) -> bool {
        self.replicates > 0
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncParams {
    #[arg(long, default_value_t = 30_000)]
    pub sync_timeout_ms: u64,
    #[arg(long, default_value_t = 3)]
    pub max_missed_rounds: usize,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 30_000,
            max_missed_rounds: 3,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ForgeError::Config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ForgeError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Copies every option the user typed explicitly on top of a file-loaded config.
    pub fn merge_from_cli(&mut self, cli: &Config, matches: &ArgMatches) {
        macro_rules! update_if_present {
            ($section:ident, $field:ident, $arg_name:expr) => {
                if matches.value_source($arg_name) == Some(ValueSource::CommandLine) {
                    self.$section.$field = cli.$section.$field.clone();
                }
            };
        }

        update_if_present!(search, num_init_trees, "num_init_trees");
        update_if_present!(search, num_nni_trees, "num_nni_trees");
        update_if_present!(search, num_support_trees, "num_support_trees");
        update_if_present!(search, pop_size, "pop_size");
        update_if_present!(search, speed_nni, "speed_nni");
        update_if_present!(search, loglh_epsilon, "loglh_epsilon");
        update_if_present!(search, max_rollbacks, "max_rollbacks");
        update_if_present!(search, start_tree, "start_tree");
        update_if_present!(search, threads, "threads");

        update_if_present!(perturb, perturbation, "perturbation");
        update_if_present!(perturb, strength, "strength");
        update_if_present!(perturb, tabu, "tabu");
        update_if_present!(perturb, fix_stable_splits, "fix_stable_splits");
        update_if_present!(perturb, stable_threshold, "stable_threshold");
        update_if_present!(perturb, k_represent, "k_represent");
        update_if_present!(perturb, k_delete_min, "k_delete_min");

        update_if_present!(stop, condition, "condition");
        update_if_present!(stop, max_iterations, "max_iterations");
        update_if_present!(stop, min_iterations, "min_iterations");
        update_if_present!(stop, required_iterations, "required_iterations");
        update_if_present!(stop, unsuccessful_iterations, "unsuccessful_iterations");
        update_if_present!(stop, max_time_secs, "max_time_secs");

        update_if_present!(bootstrap, replicates, "replicates");
        update_if_present!(bootstrap, ufboot_epsilon, "ufboot_epsilon");
        update_if_present!(bootstrap, step_iterations, "step_iterations");
        update_if_present!(bootstrap, min_correlation, "min_correlation");
        update_if_present!(bootstrap, max_snapshots, "max_snapshots");
        update_if_present!(bootstrap, bootstrap_seed, "bootstrap_seed");

        update_if_present!(sync, sync_timeout_ms, "sync_timeout_ms");
        update_if_present!(sync, max_missed_rounds, "max_missed_rounds");
    }

    pub fn validate(&self) -> ForgeResult<()> {
        let s = &self.search;
        if s.num_init_trees == 0 || s.num_nni_trees == 0 || s.num_support_trees == 0 {
            return Err(ForgeError::Config(
                "Candidate set capacities must be positive".into(),
            ));
        }
        if s.pop_size == 0 {
            return Err(ForgeError::Config("--pop-size must be positive".into()));
        }
        if s.loglh_epsilon < 0.0 {
            return Err(ForgeError::Config("--loglh-epsilon must be >= 0".into()));
        }
        let p = &self.perturb;
        if !(p.strength > 0.0 && p.strength <= 1.0) {
            return Err(ForgeError::Config("--strength must be in (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&p.stable_threshold) {
            return Err(ForgeError::Config(
                "--stable-threshold must be in [0, 1]".into(),
            ));
        }
        if p.k_represent == 0 {
            return Err(ForgeError::Config("--k-represent must be positive".into()));
        }
        let b = &self.bootstrap;
        if !(b.min_correlation > 0.0 && b.min_correlation <= 1.0) {
            return Err(ForgeError::Config(
                "--min-correlation must be in (0, 1]".into(),
            ));
        }
        if self.stop.condition == StopCondition::BootstrapCorrelation && !b.enabled() {
            return Err(ForgeError::Config(
                "--stop bootstrap-correlation needs --replicates > 0".into(),
            ));
        }
        if b.enabled() && b.max_snapshots < 2 {
            return Err(ForgeError::Config("--max-snapshots must be >= 2".into()));
        }
        Ok(())
    }

    /// Checks that need the data set size, run once the alignment is loaded.
    pub fn validate_for_taxa(&self, leaf_count: usize) -> ForgeResult<()> {
        let limit = leaf_count / 2;
        if self.perturb.k_delete_min > limit {
            return Err(ForgeError::Config(format!(
                "--k-delete-min {} exceeds half the taxa ({} of {})",
                self.perturb.k_delete_min, limit, leaf_count
            )));
        }
        Ok(())
    }

    /// Rayon pool size: explicit `--threads` or every core.
    pub fn thread_count(&self) -> usize {
        if self.search.threads == 0 {
            num_cpus::get()
        } else {
            self.search.threads
        }
    }
}
