use super::iqp::{self, IqpState};
use super::nni::{MoveEngine, NniOutcome, NniSettings, NoObserver, TabuSet, TreeObserver};
use super::perturbation::{perturb_stable_splits, random_nni, PerturbationKind};
use crate::bootstrap::{BootstrapAccumulator, BootstrapSamples, RellObserver, ReplicateSlice};
use crate::candidates::{parse_candidate, CandidateRecord, CandidateSet, UpdateOutcome};
use crate::checkpoint::{CheckpointState, CheckpointStore, SearchPhase};
use crate::config::Config;
use crate::consts::{
    DUPLICATE_RANDOM_NNIS, ESTIMATE_AFTER_ITERATION, PROGRESS_INTERVAL, WORST_SCORE,
};
use crate::error::{ForgeError, ForgeResult};
use crate::oracle::ScoringOracle;
use crate::stop_rule::{SearchState, StopRule};
use crate::sync::{SyncCoordinator, SyncHost};
use crate::topology::constraint::{allows, satisfies};
use crate::topology::{Branch, ConstraintTopology, LeafId, PartitionScheme, Topology};
use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ValueEnum,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StartTree {
    /// Randomised stepwise addition, each leaf placed where the score is best.
    Parsimony,
    /// Random insertion order and random branches.
    Random,
}

/// Everything one search process needs, passed down explicitly.
#[derive(TypedBuilder, Clone)]
pub struct SearchContext {
    pub oracle: Arc<dyn ScoringOracle>,
    pub names: Vec<String>,
    #[builder(default)]
    pub config: Config,
    #[builder(default)]
    pub constraint: Option<ConstraintTopology>,
    #[builder(default)]
    pub partitions: PartitionScheme,
    #[builder(default = 0)]
    pub rank: usize,
    #[builder(default = 1)]
    pub nprocs: usize,
}

impl SearchContext {
    pub fn leaf_count(&self) -> usize {
        self.names.len()
    }

    /// Same context for another rank of the same run.
    pub fn for_rank(&self, rank: usize) -> Self {
        let mut ctx = self.clone();
        ctx.rank = rank;
        ctx
    }
}

/// Builds a complete start tree leaf by leaf. Every placement keeps the tree
/// compatible with the constraint when some branch allows it.
pub fn build_start_tree(
    kind: StartTree,
    oracle: &dyn ScoringOracle,
    leaf_count: usize,
    constraint: Option<&ConstraintTopology>,
    rng: &mut fastrand::Rng,
) -> ForgeResult<Topology> {
    let mut order: Vec<LeafId> = (0..leaf_count).collect();
    rng.shuffle(&mut order);
    if order.len() < 3 {
        return Err(ForgeError::Validation(format!(
            "need at least 3 taxa to build a tree, got {}",
            leaf_count
        )));
    }
    let mut topo = Topology::star(leaf_count, [order[0], order[1], order[2]])?;
    for &leaf in &order[3..] {
        let branches = topo.branches();
        let mut best: Vec<Branch> = Vec::new();
        let mut best_score = WORST_SCORE;
        for &branch in &branches {
            let mut trial = topo.clone();
            trial.attach_leaf(leaf, branch)?;
            if !satisfies(constraint, &trial) {
                continue;
            }
            let score = match kind {
                StartTree::Parsimony => oracle.full_evaluate(&trial)?,
                StartTree::Random => 0.0,
            };
            if score > best_score || best.is_empty() {
                best_score = score;
                best.clear();
                best.push(branch);
            } else if score == best_score {
                best.push(branch);
            }
        }
        let target = if best.is_empty() {
            warn!(
                "⚠️  No constraint-compatible branch for leaf {}, placing it at random",
                leaf
            );
            branches[rng.usize(..branches.len())]
        } else {
            best[rng.usize(..best.len())]
        };
        topo.attach_leaf(leaf, target)?;
    }
    Ok(topo)
}

/// Candidate population, counters and tuning state of one process.
pub struct SearchCore {
    candidates: CandidateSet,
    stop_rule: StopRule,
    bootstrap: Option<BootstrapAccumulator>,
    iqp: IqpState,
    phase: SearchPhase,
    stable_threshold: f64,
    track_occurrences: bool,
    last_correlation: f64,
}

impl SearchCore {
    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    pub fn stop_rule(&self) -> &StopRule {
        &self.stop_rule
    }

    /// Merges one scored tree. With `update_stop_rule` it also counts as an
    /// iteration of the search.
    pub fn add_tree(
        &mut self,
        tree: &str,
        score: f64,
        update_stop_rule: bool,
        source: usize,
    ) -> UpdateOutcome {
        let prev_best = self.candidates.best_score();
        let outcome = self.candidates.update_from(tree, score, source);
        if outcome.rank().is_some() && self.track_occurrences {
            self.candidates
                .compute_split_occurrences(self.stable_threshold);
        }
        if !update_stop_rule {
            return outcome;
        }

        let it = self.stop_rule.increment();
        if score > prev_best && outcome.rank().is_some() {
            self.stop_rule.add_improved_iteration(it);
            if prev_best > WORST_SCORE {
                info!("🌟 BETTER TREE FOUND at iteration {}: {:.4}", it, score);
            }
        }
        if it % PROGRESS_INTERVAL == 0 {
            let best = self.candidates.best_score();
            if it > ESTIMATE_AFTER_ITERATION {
                info!(
                    "📈 Iteration {} / Score: {:.4} / Best: {:.4} / Time: {:.0}s / Remaining: {:.0}s",
                    it,
                    score,
                    best,
                    self.stop_rule.elapsed().as_secs_f64(),
                    self.stop_rule.remaining_time(it).as_secs_f64()
                );
            } else {
                info!(
                    "📈 Iteration {} / Score: {:.4} / Best: {:.4} / Time: {:.0}s",
                    it,
                    score,
                    best,
                    self.stop_rule.elapsed().as_secs_f64()
                );
            }
        }
        outcome
    }

    fn check_invariants(&self) -> ForgeResult<()> {
        if self.candidates.len() > self.candidates.capacity() {
            return Err(ForgeError::Invariant(format!(
                "candidate set holds {} trees, capacity {}",
                self.candidates.len(),
                self.candidates.capacity()
            )));
        }
        Ok(())
    }
}

impl SyncHost for SearchCore {
    fn add_tree(
        &mut self,
        tree: &str,
        score: f64,
        update_stop_rule: bool,
        source: usize,
    ) -> UpdateOutcome {
        SearchCore::add_tree(self, tree, score, update_stop_rule, source)
    }

    fn skip_iteration(&mut self) {
        self.stop_rule.increment();
    }

    fn top_records(&self, k: usize) -> Vec<CandidateRecord> {
        self.candidates.iter().take(k).cloned().collect()
    }

    fn bootstrap_slice(&self) -> Option<ReplicateSlice> {
        self.bootstrap.as_ref().map(|b| b.owned_slice())
    }

    fn absorb_bootstrap(&mut self, slice: &ReplicateSlice) {
        if let Some(b) = self.bootstrap.as_mut() {
            b.absorb(slice);
        }
    }

    fn logl_cutoff(&self) -> Option<f64> {
        self.bootstrap.as_ref().and_then(|b| b.logl_cutoff())
    }

    fn adopt_logl_cutoff(&mut self, cutoff: Option<f64>) {
        if let (Some(b), Some(c)) = (self.bootstrap.as_mut(), cutoff) {
            b.set_logl_cutoff(Some(c));
        }
    }

    fn signal_stop(&mut self) {
        self.stop_rule.signal_stop();
    }
}

/// One process's share of the stochastic NNI search.
pub struct TreeSearch {
    ctx: SearchContext,
    core: SearchCore,
    sync: Option<SyncCoordinator>,
    checkpoint: Option<CheckpointStore>,
    settings: NniSettings,
    rng: fastrand::Rng,
    bootstrap_rng: fastrand::Rng,
}

impl TreeSearch {
    pub fn new(
        ctx: SearchContext,
        sync: Option<SyncCoordinator>,
        checkpoint: Option<CheckpointStore>,
        seed: u64,
    ) -> Self {
        let cfg = &ctx.config;
        let n = ctx.leaf_count();
        let bootstrap = cfg.bootstrap.enabled().then(|| {
            let samples = BootstrapSamples::generate(
                ctx.oracle.pattern_weights(),
                cfg.bootstrap.replicates,
                cfg.bootstrap.bootstrap_seed,
            );
            let range =
                BootstrapAccumulator::owned_range(samples.len(), ctx.rank, ctx.nprocs);
            BootstrapAccumulator::new(
                samples,
                n,
                range,
                cfg.bootstrap.ufboot_epsilon,
                cfg.bootstrap.max_snapshots,
            )
        });
        let core = SearchCore {
            candidates: CandidateSet::new(cfg.search.num_init_trees, n),
            stop_rule: StopRule::new(&cfg.stop, &cfg.bootstrap),
            bootstrap,
            iqp: IqpState::new(n, cfg.perturb.k_delete_min),
            phase: SearchPhase::InitialPopulation,
            stable_threshold: cfg.perturb.stable_threshold,
            track_occurrences: cfg.perturb.fix_stable_splits
                || cfg.perturb.perturbation == PerturbationKind::StableSplits
                || cfg.perturb.tabu,
            last_correlation: 0.0,
        };
        let rank_seed = seed ^ (ctx.rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut search = Self {
            settings: NniSettings::from_config(cfg),
            rng: fastrand::Rng::with_seed(rank_seed),
            bootstrap_rng: fastrand::Rng::with_seed(rank_seed.wrapping_add(1)),
            ctx,
            core,
            sync,
            checkpoint,
        };
        search.restore();
        search
    }

    fn restore(&mut self) {
        let Some(saved) = self.checkpoint.as_ref().and_then(|c| c.load()) else {
            return;
        };
        if saved.phase == SearchPhase::InitialPopulation {
            info!("♻️  Checkpoint predates the main loop; rebuilding the initial population");
            return;
        }
        let cfg = &self.ctx.config;
        self.core.candidates = CandidateSet::from_records(
            cfg.search.num_support_trees,
            self.ctx.leaf_count(),
            &saved.candidates,
        );
        if self.core.track_occurrences {
            self.core
                .candidates
                .compute_split_occurrences(self.core.stable_threshold);
        }
        self.core.stop_rule = StopRule::restore(&cfg.stop, &cfg.bootstrap, saved.stop_rule);
        if let (Some(acc), Some(state)) = (self.core.bootstrap.as_mut(), saved.bootstrap) {
            acc.restore(state);
            self.core.last_correlation = acc.correlation();
        }
        self.core.iqp = saved.iqp;
        self.core.phase = saved.phase;
    }

    pub fn context(&self) -> &SearchContext {
        &self.ctx
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.core.candidates
    }

    pub fn bootstrap(&self) -> Option<&BootstrapAccumulator> {
        self.core.bootstrap.as_ref()
    }

    pub fn phase(&self) -> SearchPhase {
        self.core.phase
    }

    pub fn iqp_state(&self) -> &IqpState {
        &self.core.iqp
    }

    pub fn stop_reason(&self) -> SearchState {
        self.core.stop_rule.stop_reason()
    }

    pub fn best_score(&self) -> f64 {
        self.core.candidates.best_score()
    }

    pub fn best_tree_strings(&self, k: usize) -> Vec<String> {
        self.core.candidates.best_tree_strings(k)
    }

    pub fn iterations(&self) -> usize {
        self.core.stop_rule.cur_it()
    }

    fn is_worker(&self) -> bool {
        self.ctx.rank != 0 && self.sync.is_some()
    }

    pub fn add_tree(
        &mut self,
        tree: &str,
        score: f64,
        update_stop_rule: bool,
        source: usize,
    ) -> UpdateOutcome {
        self.core.add_tree(tree, score, update_stop_rule, source)
    }

    /// Builds the starting population and the first locally optimal trees.
    pub fn init_candidate_set(&mut self, n_initial: usize, n_to_optimize: usize) -> ForgeResult<()> {
        let nprocs = self.ctx.nprocs.max(1);
        let leaf_count = self.ctx.leaf_count();
        let kind = self.ctx.config.search.start_tree;
        let wanted = n_initial
            .div_ceil(nprocs)
            .saturating_sub(self.core.candidates.len())
            .max(1);
        self.core.candidates.set_capacity(n_initial.max(wanted));
        info!("🌱 Generating {} {} start trees", wanted, kind);

        for _ in 0..wanted {
            let mut topo = build_start_tree(
                kind,
                &*self.ctx.oracle,
                leaf_count,
                self.ctx.constraint.as_ref(),
                &mut self.rng,
            )?;
            let mut outcome = self.core.candidates.update(&topo.tree_string(), WORST_SCORE);
            let mut tries = 0;
            while outcome == UpdateOutcome::DuplicateWorse && tries < leaf_count {
                self.randomize(&mut topo, DUPLICATE_RANDOM_NNIS);
                outcome = self.core.candidates.update(&topo.tree_string(), WORST_SCORE);
                tries += 1;
            }
            if outcome == UpdateOutcome::DuplicateWorse {
                debug!("Start tree stayed a duplicate after {} shuffles", tries);
            }
        }

        let oracle = &*self.ctx.oracle;
        let scored: Vec<(String, f64)> = self
            .core
            .candidates
            .records()
            .par_iter()
            .filter_map(|record| {
                let mut topo = parse_candidate(&record.tree, leaf_count)?;
                match oracle.reoptimize(&mut topo, 2) {
                    Ok(score) => Some((topo.tree_string(), score)),
                    Err(e) => {
                        warn!("⚠️  Dropping start tree: {}", e);
                        None
                    }
                }
            })
            .collect();
        self.core.candidates.clear();
        for (tree, score) in &scored {
            self.core.candidates.update_from(tree, *score, self.ctx.rank);
        }
        info!(
            "🌳 {} start trees scored, best {:.4}",
            scored.len(),
            self.core.candidates.best_score()
        );

        if let Some(sync) = self.sync.as_mut() {
            sync.sync_candidate_sets(n_to_optimize, false, &mut self.core);
        }

        let share = self.core.candidates.best_tree_strings_for_process(
            n_to_optimize,
            self.ctx.rank,
            nprocs,
        );
        self.core.stop_rule.set_cur_it(0);
        self.core.candidates.clear();
        self.core
            .candidates
            .set_capacity(self.ctx.config.search.num_support_trees);
        info!("🧗 Optimizing {} start trees with NNI", share.len());

        for tree in share {
            let Some(mut topo) = parse_candidate(&tree, leaf_count) else {
                warn!("⚠️  Skipping unparsable start tree");
                continue;
            };
            let score = match self.ctx.oracle.reoptimize(&mut topo, 1) {
                Ok(s) => s,
                Err(e) => {
                    warn!("⚠️  Skipping start tree: {}", e);
                    continue;
                }
            };
            let outcome = self.local_search(&mut topo, score, None);
            self.core
                .add_tree(&topo.tree_string(), outcome.score, true, self.ctx.rank);
            self.core.check_invariants()?;
        }

        let support = self.ctx.config.search.num_support_trees;
        if let Some(sync) = self.sync.as_mut() {
            sync.sync_candidate_sets(support, true, &mut self.core);
        }
        self.core.phase = SearchPhase::Optimization;
        self.save_checkpoint();
        info!(
            "✅ Initial candidate set ready: {} trees, best {:.4}",
            self.core.candidates.len(),
            self.core.candidates.best_score()
        );
        Ok(())
    }

    /// Runs perturbation and NNI until the stop rule fires. Returns the best score.
    pub fn run_search_loop(&mut self) -> ForgeResult<f64> {
        if self.core.phase == SearchPhase::InitialPopulation {
            let s = &self.ctx.config.search;
            let (n_init, n_nni) = (s.num_init_trees, s.num_nni_trees);
            self.init_candidate_set(n_init, n_nni)?;
        }
        if self.core.phase == SearchPhase::Finished {
            info!("🏁 Checkpoint says this search already finished");
            return Ok(self.best_score());
        }
        info!(
            "🔥 Starting stochastic search at iteration {} (rank {} of {})",
            self.core.stop_rule.cur_it(),
            self.ctx.rank,
            self.ctx.nprocs
        );

        loop {
            let cur_it = self.core.stop_rule.cur_it();
            let stop = if self.is_worker() {
                self.core.stop_rule.meet_limit(cur_it)
            } else {
                let corr = self.core.last_correlation;
                self.core.stop_rule.meet_stop_condition(cur_it, corr)
            };
            if stop {
                break;
            }
            self.iteration()?;
        }

        let reason = self.core.stop_rule.stop_reason();
        if let Some(sync) = self.sync.as_mut() {
            if sync.is_coordinator() {
                sync.send_stop(&mut self.core);
            } else if reason != SearchState::StoppedBySignal {
                let best = self.core.candidates.best_tree_strings(1);
                let score = self.core.candidates.best_score();
                sync.leave(best.first().map(String::as_str), score, &self.core);
            }
        }
        self.core.phase = SearchPhase::Finished;
        self.save_checkpoint();
        info!(
            "🏁 Search finished after {} iterations ({}), best {:.4}",
            self.core.stop_rule.cur_it(),
            reason,
            self.best_score()
        );
        Ok(self.best_score())
    }

    fn iteration(&mut self) -> ForgeResult<()> {
        if let Some(acc) = self.core.bootstrap.as_mut() {
            acc.update_logl_cutoff();
        }

        let pop_size = self.ctx.config.search.pop_size;
        let start = self
            .core
            .candidates
            .rand_top_tree(pop_size, &mut self.rng)
            .ok_or_else(|| ForgeError::Invariant("candidate set is empty".into()))?;
        let result = parse_candidate(&start, self.ctx.leaf_count())
            .ok_or_else(|| ForgeError::Newick(format!("unparsable candidate {}", start)))
            .and_then(|mut topo| {
                let tabu = self.perturb(&mut topo)?;
                let score = self.ctx.oracle.reoptimize(&mut topo, 1)?;
                let outcome = self.local_search(&mut topo, score, tabu);
                Ok((topo, outcome))
            });

        let (tree, score, landed) = match result {
            Ok((topo, outcome)) => {
                let tree = topo.tree_string();
                let prev_best = self.core.candidates.best_score();
                let update = self
                    .core
                    .add_tree(&tree, outcome.score, true, self.ctx.rank);
                self.core.check_invariants()?;
                if self.ctx.config.perturb.perturbation == PerturbationKind::Iqp {
                    if update == UpdateOutcome::DuplicateWorse {
                        self.core.iqp.increase_k_delete();
                    } else if outcome.score > prev_best {
                        self.core.iqp.reset_k_delete();
                    }
                }
                let landed = update.rank().is_some_and(|r| r < pop_size);
                (Some(tree), outcome.score, landed)
            }
            Err(e) => {
                warn!("⚠️  Iteration produced no tree: {}", e);
                self.core.stop_rule.increment();
                (None, WORST_SCORE, false)
            }
        };

        if let Some(sync) = self.sync.as_mut() {
            sync.sync_current_tree(tree.as_deref(), score, landed, &mut self.core);
        }
        if !self.is_worker() {
            self.bootstrap_schedule();
        }
        self.save_checkpoint();
        Ok(())
    }

    /// Applies the configured perturbation. Returns the tabu splits for the
    /// first NNI step, if any.
    fn perturb(&mut self, topo: &mut Topology) -> ForgeResult<Option<TabuSet>> {
        let perturb = &self.ctx.config.perturb;
        let constraint = self.ctx.constraint.as_ref();
        let occurrences = Some(self.core.candidates.split_occurrences())
            .filter(|_| self.core.track_occurrences);
        let tabu = match perturb.perturbation {
            PerturbationKind::RandomNni => Some(random_nni(
                topo,
                perturb.strength,
                perturb.tabu,
                occurrences,
                &self.settings,
                constraint,
                &mut self.rng,
            )),
            PerturbationKind::StableSplits => {
                let applied = occurrences.map_or(0, |occ| {
                    perturb_stable_splits(
                        topo,
                        occ,
                        perturb.stable_threshold,
                        constraint,
                        &mut self.rng,
                    )
                });
                if applied == 0 {
                    debug!("No stable split to shake, falling back to random NNI");
                    Some(random_nni(
                        topo,
                        perturb.strength,
                        perturb.tabu,
                        occurrences,
                        &self.settings,
                        constraint,
                        &mut self.rng,
                    ))
                } else {
                    None
                }
            }
            PerturbationKind::Iqp => {
                let moved = iqp::perturb(
                    topo,
                    &*self.ctx.oracle,
                    self.core.iqp.k_delete,
                    perturb.k_represent,
                    constraint,
                    &mut self.rng,
                )?;
                debug!("IQP moved {} leaves", moved.len());
                None
            }
        };
        if !satisfies(constraint, topo) {
            return Err(ForgeError::Validation(
                "perturbed tree violates the constraint".into(),
            ));
        }
        Ok(tabu.filter(|t| !t.is_empty()))
    }

    fn local_search(&mut self, topo: &mut Topology, score: f64, tabu: Option<TabuSet>) -> NniOutcome {
        let occurrences = Some(self.core.candidates.split_occurrences())
            .filter(|_| self.settings.fix_stable_splits);
        let engine = MoveEngine::new(&*self.ctx.oracle, self.settings)
            .with_constraint(self.ctx.constraint.as_ref())
            .with_occurrences(occurrences);

        let mut no_observer = NoObserver;
        let mut rell;
        let observer: &mut dyn TreeObserver = match self.core.bootstrap.as_mut() {
            Some(accumulator) => {
                rell = RellObserver {
                    accumulator,
                    oracle: &*self.ctx.oracle,
                    rng: &mut self.bootstrap_rng,
                };
                &mut rell
            }
            None => &mut no_observer,
        };
        let outcome = engine.optimize(topo, score, tabu, &mut self.rng, observer);
        debug!(
            "NNI: {} steps, {} moves, score {:.4}",
            outcome.steps, outcome.applied, outcome.score
        );
        outcome
    }

    /// Random NNIs used to break up duplicate start trees.
    fn randomize(&mut self, topo: &mut Topology, moves: usize) {
        for _ in 0..moves {
            let internal = topo.internal_branches();
            if internal.is_empty() {
                return;
            }
            let branch = internal[self.rng.usize(..internal.len())];
            let Ok(swap) = topo.random_nni(branch, &mut self.rng) else {
                continue;
            };
            if allows(self.ctx.constraint.as_ref(), topo, &swap) {
                let _ = topo.apply_swap(&swap);
            }
        }
    }

    fn bootstrap_schedule(&mut self) {
        let Some(acc) = self.core.bootstrap.as_mut() else {
            return;
        };
        let rule = &mut self.core.stop_rule;
        let cur_it = rule.cur_it();
        if cur_it >= rule.next_snapshot_at() {
            acc.take_snapshot(cur_it);
            rule.advance_snapshot();
        }
        if cur_it >= rule.next_correlation_check() {
            let corr = acc.correlation();
            self.core.last_correlation = corr;
            rule.meet_correlation(corr);
        }
    }

    pub fn checkpoint_state(&self, fingerprint: &str) -> CheckpointState {
        CheckpointState {
            fingerprint: fingerprint.to_string(),
            phase: self.core.phase,
            stop_rule: self.core.stop_rule.snapshot(),
            candidates: self.core.candidates.records(),
            bootstrap: self.core.bootstrap.as_ref().map(|b| b.state()),
            iqp: self.core.iqp,
        }
    }

    fn save_checkpoint(&self) {
        let Some(store) = self.checkpoint.as_ref() else {
            return;
        };
        let state = self.checkpoint_state(store.fingerprint());
        if let Err(e) = store.save(&state) {
            warn!("⚠️  Checkpoint write failed: {}", e);
        }
    }
}
