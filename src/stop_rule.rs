use crate::config::{BootstrapParams, StopParams};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};
use tracing::info;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ValueEnum,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    FixedIterations,
    UnsuccessfulIterations,
    BootstrapCorrelation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    Running,
    Converged,
    StoppedByLimit,
    StoppedBySignal,
}

/// Every counter of a [`StopRule`]; this is what a checkpoint stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRuleState {
    pub cur_it: usize,
    pub improved_iterations: Vec<usize>,
    pub elapsed_secs: f64,
    pub next_snapshot_at: usize,
    pub next_correlation_check: usize,
    pub state: SearchState,
}

#[derive(Debug, Clone)]
pub struct StopRule {
    condition: StopCondition,
    max_iterations: usize,
    min_iterations: usize,
    required_iterations: usize,
    unsuccessful_iterations: usize,
    min_correlation: f64,
    step_iterations: usize,
    max_time: Option<Duration>,
    state: StopRuleState,
    session_start: Instant,
}

impl StopRule {
    pub fn new(stop: &StopParams, bootstrap: &BootstrapParams) -> Self {
        let step = bootstrap.step_iterations.max(2);
        Self {
            condition: stop.condition,
            max_iterations: stop.max_iterations,
            min_iterations: stop.min_iterations,
            required_iterations: stop.required_iterations,
            unsuccessful_iterations: stop.unsuccessful_iterations,
            min_correlation: bootstrap.min_correlation,
            step_iterations: step,
            max_time: stop.max_time_secs.map(Duration::from_secs),
            state: StopRuleState {
                cur_it: 0,
                improved_iterations: Vec::new(),
                elapsed_secs: 0.0,
                next_snapshot_at: step / 2,
                next_correlation_check: stop.min_iterations.max(step),
                state: SearchState::Running,
            },
            session_start: Instant::now(),
        }
    }

    /// Rebuilds a rule from a saved state; elapsed time keeps accumulating from there.
    pub fn restore(stop: &StopParams, bootstrap: &BootstrapParams, saved: StopRuleState) -> Self {
        let mut rule = Self::new(stop, bootstrap);
        rule.state = saved;
        rule
    }

    pub fn snapshot(&self) -> StopRuleState {
        let mut state = self.state.clone();
        state.elapsed_secs = self.elapsed().as_secs_f64();
        state
    }

    pub fn condition(&self) -> StopCondition {
        self.condition
    }

    pub fn cur_it(&self) -> usize {
        self.state.cur_it
    }

    pub fn set_cur_it(&mut self, it: usize) {
        self.state.cur_it = it;
    }

    pub fn increment(&mut self) -> usize {
        self.state.cur_it += 1;
        self.state.cur_it
    }

    pub fn add_improved_iteration(&mut self, it: usize) {
        self.state.improved_iterations.push(it);
    }

    pub fn last_improved_iteration(&self) -> usize {
        self.state.improved_iterations.last().copied().unwrap_or(0)
    }

    pub fn state(&self) -> SearchState {
        self.state.state
    }

    pub fn stop_reason(&self) -> SearchState {
        self.state.state
    }

    pub fn signal_stop(&mut self) {
        self.state.state = SearchState::StoppedBySignal;
    }

    /// Wall time including earlier sessions restored from a checkpoint.
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.state.elapsed_secs) + self.session_start.elapsed()
    }

    /// Hard limits only: iteration cap, real-time cap or an earlier stop signal.
    pub fn meet_limit(&mut self, cur_it: usize) -> bool {
        if self.state.state == SearchState::StoppedBySignal {
            return true;
        }
        let over_time = self.max_time.is_some_and(|limit| self.elapsed() >= limit);
        if cur_it >= self.max_iterations || over_time {
            self.state.state = SearchState::StoppedByLimit;
            return true;
        }
        false
    }

    pub fn meet_stop_condition(&mut self, cur_it: usize, correlation: f64) -> bool {
        if self.meet_limit(cur_it) {
            return true;
        }
        match self.condition {
            StopCondition::FixedIterations => {
                if cur_it >= self.required_iterations {
                    self.state.state = SearchState::StoppedByLimit;
                    return true;
                }
            }
            StopCondition::UnsuccessfulIterations => {
                let since = cur_it.saturating_sub(self.last_improved_iteration());
                if since >= self.unsuccessful_iterations {
                    self.state.state = SearchState::Converged;
                    return true;
                }
            }
            StopCondition::BootstrapCorrelation => {
                if cur_it >= self.min_iterations
                    && correlation >= self.min_correlation
                    && cur_it >= self.state.next_correlation_check
                {
                    self.state.state = SearchState::Converged;
                    return true;
                }
            }
        }
        false
    }

    /// Records one correlation test; a failed test buys at least one more step.
    pub fn meet_correlation(&mut self, correlation: f64) -> bool {
        if correlation >= self.min_correlation {
            return true;
        }
        self.state.next_correlation_check = self.state.cur_it + self.step_iterations;
        info!(
            "📉 Split-support correlation {:.4} < {:.4}, next check at iteration {}",
            correlation, self.min_correlation, self.state.next_correlation_check
        );
        false
    }

    pub fn next_snapshot_at(&self) -> usize {
        self.state.next_snapshot_at
    }

    pub fn advance_snapshot(&mut self) {
        self.state.next_snapshot_at = self.state.cur_it + self.step_iterations / 2;
    }

    pub fn next_correlation_check(&self) -> usize {
        self.state.next_correlation_check
    }

    pub fn predicted_iterations(&self) -> usize {
        match self.condition {
            StopCondition::FixedIterations => self.required_iterations.max(self.max_iterations),
            StopCondition::UnsuccessfulIterations => {
                self.last_improved_iteration() + self.unsuccessful_iterations
            }
            StopCondition::BootstrapCorrelation => self.max_iterations,
        }
    }

    pub fn remaining_time(&self, cur_it: usize) -> Duration {
        if cur_it == 0 {
            return Duration::ZERO;
        }
        let remaining = self.predicted_iterations().saturating_sub(cur_it);
        self.elapsed().mul_f64(remaining as f64 / cur_it as f64)
    }
}
