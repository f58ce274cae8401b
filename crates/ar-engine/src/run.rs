//! Run state: the single source of truth for one optimization run.

use ar_optimizer::{FrontierPoint, ParetoFrontier};
use ar_types::{ConfigSpace, ObjectiveWeights, Trial, TrialId, TrialStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run identifier.
pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailureKind {
    TooManyFailures,
    Persistence,
    Internal,
}

/// Why a run ended in [`RunStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: RunFailureKind,
    pub message: String,
}

/// Full state of one run: space, budget, trial history and frontier.
///
/// The orchestrator is the only writer. Readers clone snapshots through
/// [`RunHandle`](crate::orchestrator::RunHandle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub name: String,
    pub config_space: ConfigSpace,
    /// Maximum number of budget-counted trials.
    pub budget: usize,
    /// Trials in creation order.
    pub trials: Vec<Trial>,
    pub frontier: ParetoFrontier,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(name: impl Into<String>, config_space: ConfigSpace, budget: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            name: name.into(),
            config_space,
            budget,
            trials: Vec::new(),
            frontier: ParetoFrontier::new(),
            status: RunStatus::Created,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn trial(&self, id: TrialId) -> Option<&Trial> {
        self.trials.iter().find(|t| t.id == id)
    }

    pub fn trial_mut(&mut self, id: TrialId) -> Option<&mut Trial> {
        self.trials.iter_mut().find(|t| t.id == id)
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }

    /// Trials that consume budget: everything except cancelled trials.
    pub fn budget_used(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| t.status.counts_toward_budget())
            .count()
    }

    pub fn remaining_budget(&self) -> usize {
        self.budget.saturating_sub(self.budget_used())
    }

    /// Index of the next trial within the run.
    pub fn next_trial_number(&self) -> usize {
        self.trials.len()
    }

    /// Index of the next proposal batch.
    pub fn next_batch(&self) -> usize {
        self.trials.iter().map(|t| t.batch + 1).max().unwrap_or(0)
    }

    /// Seconds between the first start and the finish (or now while running).
    pub fn elapsed_secs(&self) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - started).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Frontier members ranked by `weights`, resolved to their trials.
    pub fn ranked_trials(&self, weights: &ObjectiveWeights) -> Vec<&Trial> {
        self.frontier
            .rank(weights)
            .into_iter()
            .filter_map(|p| self.trial(p.trial_id))
            .collect()
    }

    pub fn progress(&self, weights: &ObjectiveWeights) -> ProgressSnapshot {
        let succeeded = self.count(TrialStatus::Succeeded);
        let failed = self.count(TrialStatus::Failed);
        ProgressSnapshot {
            run_id: self.run_id,
            name: self.name.clone(),
            status: self.status,
            trials_completed: succeeded + failed,
            trials_succeeded: succeeded,
            trials_failed: failed,
            trials_running: self.count(TrialStatus::Running),
            trials_total_budget: self.budget,
            current_frontier_size: self.frontier.len(),
            elapsed_secs: self.elapsed_secs(),
            recommended: self.frontier.best_by(weights).cloned(),
            failure: self.failure.clone(),
        }
    }
}

/// Pull-based progress report, cheap to produce while a run is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: RunId,
    pub name: String,
    pub status: RunStatus,
    /// Trials in a finished state (succeeded or failed).
    pub trials_completed: usize,
    pub trials_succeeded: usize,
    pub trials_failed: usize,
    pub trials_running: usize,
    pub trials_total_budget: usize,
    pub current_frontier_size: usize,
    pub elapsed_secs: f64,
    /// Top-ranked frontier member under the reporting weights.
    pub recommended: Option<FrontierPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::{Configuration, EvaluationError, ObjectiveVector};
    use rust_decimal_macros::dec;

    fn state_with_trials() -> RunState {
        let mut state = RunState::new("test", ConfigSpace::retrieval_preset(), 5);
        let config = Configuration::from_values([("top_k", 1_i64)]);

        let mut ok = Trial::new(0, 0, config.clone());
        ok.mark_running().unwrap();
        ok.mark_succeeded(ObjectiveVector::new(0.8, dec!(0.1), 1.0).unwrap(), 1)
            .unwrap();
        state.frontier.insert(ok.id, ok.objectives.unwrap());

        let mut failed = Trial::new(1, 0, config.clone());
        failed.mark_running().unwrap();
        failed
            .mark_failed(&EvaluationError::Timeout { timeout_secs: 1.0 }, 3)
            .unwrap();

        let mut cancelled = Trial::new(2, 1, config.clone());
        cancelled.mark_cancelled().unwrap();

        let mut running = Trial::new(3, 1, config);
        running.mark_running().unwrap();

        state.trials = vec![ok, failed, cancelled, running];
        state
    }

    #[test]
    fn budget_skips_cancelled_trials() {
        let state = state_with_trials();
        assert_eq!(state.budget_used(), 3);
        assert_eq!(state.remaining_budget(), 2);
        assert_eq!(state.next_trial_number(), 4);
        assert_eq!(state.next_batch(), 2);
    }

    #[test]
    fn progress_counts_by_status() {
        let state = state_with_trials();
        let progress = state.progress(&ObjectiveWeights::default());
        assert_eq!(progress.status, RunStatus::Created);
        assert_eq!(progress.trials_completed, 2);
        assert_eq!(progress.trials_succeeded, 1);
        assert_eq!(progress.trials_failed, 1);
        assert_eq!(progress.trials_running, 1);
        assert_eq!(progress.trials_total_budget, 5);
        assert_eq!(progress.current_frontier_size, 1);
        assert_eq!(progress.elapsed_secs, 0.0);
        assert_eq!(
            progress.recommended.map(|p| p.trial_id),
            Some(state.trials[0].id)
        );
    }

    #[test]
    fn ranked_trials_resolve_frontier_members() {
        let state = state_with_trials();
        let ranked = state.ranked_trials(&ObjectiveWeights::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].number, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Created.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
