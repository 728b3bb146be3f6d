pub mod message;
pub mod transport;

pub use message::{Envelope, Payload};
pub use transport::{ChannelTransport, TcpTransport, Transport};

use crate::bootstrap::ReplicateSlice;
use crate::candidates::{CandidateRecord, UpdateOutcome};
use crate::config::SyncParams;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no message within {0:?}")]
    Timeout(Duration),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("peer {0} disconnected")]
    Disconnected(usize),

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// The search state a sync round reads from and merges into.
pub trait SyncHost {
    fn add_tree(
        &mut self,
        tree: &str,
        score: f64,
        update_stop_rule: bool,
        source: usize,
    ) -> UpdateOutcome;

    /// A report without a tree still counts as one iteration.
    fn skip_iteration(&mut self);

    fn top_records(&self, k: usize) -> Vec<CandidateRecord>;

    fn bootstrap_slice(&self) -> Option<ReplicateSlice>;

    fn absorb_bootstrap(&mut self, slice: &ReplicateSlice);

    fn logl_cutoff(&self) -> Option<f64>;

    fn adopt_logl_cutoff(&mut self, cutoff: Option<f64>);

    fn signal_stop(&mut self);
}

/// Rank 0 merges everybody's trees and answers; ranks 1.. report and listen.
pub struct SyncCoordinator {
    transport: Box<dyn Transport>,
    nprocs: usize,
    pop_size: usize,
    timeout: Duration,
    max_missed_rounds: usize,
    round: u64,
    live: Vec<bool>,
    missed: Vec<usize>,
    changed: Vec<bool>,
}

impl SyncCoordinator {
    pub fn new(
        transport: Box<dyn Transport>,
        nprocs: usize,
        pop_size: usize,
        params: &SyncParams,
    ) -> Self {
        let nprocs = nprocs.max(1);
        Self {
            transport,
            nprocs,
            pop_size,
            timeout: Duration::from_millis(params.sync_timeout_ms),
            max_missed_rounds: params.max_missed_rounds.max(1),
            round: 0,
            live: (0..nprocs).map(|r| r != 0).collect(),
            missed: vec![0; nprocs],
            changed: vec![false; nprocs],
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    pub fn live_workers(&self) -> usize {
        self.live.iter().filter(|&&l| l).count()
    }

    /// Full exchange of the top `k` at a phase boundary.
    pub fn sync_candidate_sets(&mut self, k: usize, update_stop_rule: bool, host: &mut dyn SyncHost) {
        if self.nprocs == 1 {
            return;
        }
        self.round += 1;
        if self.is_coordinator() {
            let incoming = self.collect(host, update_stop_rule);
            let candidates = host.top_records(k.max(self.nprocs));
            info!(
                "🔄 Candidate sets merged from {} workers, broadcasting {}",
                incoming.len(),
                candidates.len()
            );
            for (source, round) in incoming {
                self.reply(
                    source,
                    round,
                    Payload::Reply {
                        candidates: Some(candidates.clone()),
                        logl_cutoff: host.logl_cutoff(),
                    },
                );
            }
        } else {
            let batch = Payload::CandidateBatch {
                trees: host.top_records(k),
            };
            if self.send_to_coordinator(batch) {
                self.await_reply(host);
            }
        }
    }

    /// Per-iteration exchange. The coordinator's own tree is already merged;
    /// `own_landed` says whether it reached the top `pop_size`.
    pub fn sync_current_tree(
        &mut self,
        tree: Option<&str>,
        score: f64,
        own_landed: bool,
        host: &mut dyn SyncHost,
    ) {
        if self.nprocs == 1 {
            return;
        }
        self.round += 1;
        if self.is_coordinator() {
            if own_landed {
                self.mark_changed_except(0);
            }
            let incoming = self.collect(host, true);
            for (source, round) in incoming {
                if !self.live[source] {
                    continue;
                }
                let candidates = if self.changed[source] {
                    self.changed[source] = false;
                    Some(host.top_records(self.pop_size))
                } else {
                    None
                };
                self.reply(
                    source,
                    round,
                    Payload::Reply {
                        candidates,
                        logl_cutoff: host.logl_cutoff(),
                    },
                );
            }
        } else {
            let report = Payload::Report {
                tree: tree.map(str::to_string),
                score,
                leaving: false,
                bootstrap: host.bootstrap_slice(),
            };
            if self.send_to_coordinator(report) {
                self.await_reply(host);
            }
        }
    }

    /// Worker hit its own limit: final report, no reply expected.
    pub fn leave(&mut self, tree: Option<&str>, score: f64, host: &dyn SyncHost) {
        if self.nprocs == 1 || self.is_coordinator() {
            return;
        }
        self.round += 1;
        let report = Payload::Report {
            tree: tree.map(str::to_string),
            score,
            leaving: true,
            bootstrap: host.bootstrap_slice(),
        };
        if self.send_to_coordinator(report) {
            info!("👋 Worker {} leaving the search", self.rank());
        }
    }

    /// Coordinator only: merge one last report from every live worker and answer `Stop`.
    pub fn send_stop(&mut self, host: &mut dyn SyncHost) {
        if self.nprocs == 1 || !self.is_coordinator() {
            return;
        }
        self.round += 1;
        let incoming = self.collect(host, true);
        for (source, round) in incoming {
            if self.live[source] {
                self.reply(source, round, Payload::Stop);
                self.live[source] = false;
            }
        }
        for worker in 1..self.nprocs {
            if self.live[worker] {
                self.reply(worker, self.round, Payload::Stop);
                self.live[worker] = false;
            }
        }
        info!("🛑 Stop sent to all workers");
    }

    fn mark_changed_except(&mut self, source: usize) {
        for (worker, flag) in self.changed.iter_mut().enumerate() {
            if worker != 0 && worker != source {
                *flag = true;
            }
        }
    }

    fn send_to_coordinator(&mut self, payload: Payload) -> bool {
        let envelope = Envelope::new(self.rank(), self.round, payload);
        match self.transport.send(0, &envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️  Could not reach coordinator: {}; continuing locally", e);
                false
            }
        }
    }

    fn reply(&mut self, to: usize, round: u64, payload: Payload) {
        let envelope = Envelope::new(0, round, payload);
        if let Err(e) = self.transport.send(to, &envelope) {
            warn!("⚠️  Reply to worker {} failed: {}", to, e);
            self.live[to] = false;
        }
    }

    /// Worker side: wait for the reply to this round, or `Stop`.
    fn await_reply(&mut self, host: &mut dyn SyncHost) {
        let deadline = Instant::now() + self.timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                warn!(
                    "⚠️  No reply for round {} within {:?}; continuing with local view",
                    self.round, self.timeout
                );
                return;
            }
            let envelope = match self.transport.recv(left) {
                Ok(e) => e,
                Err(SyncError::Timeout(_)) => continue,
                Err(e) => {
                    warn!("⚠️  Receive failed: {}; continuing with local view", e);
                    return;
                }
            };
            let kind = envelope.kind();
            match envelope.payload {
                Payload::Stop => {
                    debug!("Worker {} received stop", self.rank());
                    host.signal_stop();
                    return;
                }
                Payload::Reply {
                    candidates,
                    logl_cutoff,
                } if envelope.round == self.round => {
                    for record in candidates.unwrap_or_default() {
                        host.add_tree(&record.tree, record.score, false, record.source);
                    }
                    host.adopt_logl_cutoff(logl_cutoff);
                    return;
                }
                _ => debug!(
                    "Discarding {} from round {} (expecting {})",
                    kind,
                    envelope.round,
                    self.round
                ),
            }
        }
    }

    /// Coordinator side: gather until every live worker has spoken or time runs out,
    /// merging as messages arrive. Returns `(source, round)` of everything merged.
    fn collect(&mut self, host: &mut dyn SyncHost, update_stop_rule: bool) -> Vec<(usize, u64)> {
        let mut heard = vec![false; self.nprocs];
        let mut incoming = Vec::new();
        let deadline = Instant::now() + self.timeout;
        while (1..self.nprocs).any(|w| self.live[w] && !heard[w]) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let envelope = match self.transport.recv(left) {
                Ok(e) => e,
                Err(SyncError::Timeout(_)) => break,
                Err(e) => {
                    warn!("⚠️  Receive failed: {}", e);
                    break;
                }
            };
            let source = envelope.source;
            if source == 0 || source >= self.nprocs {
                warn!("⚠️  Ignoring message from unknown rank {}", source);
                continue;
            }
            heard[source] = true;
            self.missed[source] = 0;
            let kind = envelope.kind();
            match envelope.payload {
                Payload::Report {
                    tree,
                    score,
                    leaving,
                    bootstrap,
                } => {
                    match tree {
                        Some(tree) => {
                            let outcome = host.add_tree(&tree, score, update_stop_rule, source);
                            if outcome.rank().is_some_and(|r| r < self.pop_size) {
                                self.mark_changed_except(source);
                            }
                        }
                        None => {
                            if update_stop_rule {
                                host.skip_iteration();
                            }
                        }
                    }
                    if let Some(slice) = bootstrap {
                        host.absorb_bootstrap(&slice);
                    }
                    if leaving {
                        info!("👋 Worker {} left the search", source);
                        self.live[source] = false;
                        continue;
                    }
                }
                Payload::CandidateBatch { trees } => {
                    for record in trees {
                        host.add_tree(&record.tree, record.score, update_stop_rule, source);
                    }
                }
                _ => {
                    warn!("⚠️  Unexpected {} from worker {}", kind, source);
                    continue;
                }
            }
            incoming.push((source, envelope.round));
        }

        for worker in 1..self.nprocs {
            if self.live[worker] && !heard[worker] {
                self.missed[worker] += 1;
                warn!(
                    "⚠️  Worker {} sent nothing this round ({} missed)",
                    worker, self.missed[worker]
                );
                if self.missed[worker] >= self.max_missed_rounds {
                    warn!("⚠️  Worker {} considered gone", worker);
                    self.live[worker] = false;
                }
            }
        }
        incoming
    }
}
