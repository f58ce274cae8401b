//! Trial tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EvaluationError, FailureReason, RunError};
use crate::objective::ObjectiveVector;
use crate::space::Configuration;

/// Unique trial identifier.
pub type TrialId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Every trial except a cancelled one consumes a unit of budget.
    pub fn counts_toward_budget(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why a trial ended in [`TrialStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialError {
    pub reason: FailureReason,
    pub message: String,
}

impl From<&EvaluationError> for TrialError {
    fn from(err: &EvaluationError) -> Self {
        Self {
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

/// One scheduled evaluation attempt of a single configuration.
///
/// Only the orchestrator mutates trials. Terminal states are final; the one
/// backward edge is [`Trial::requeue`], used when a crashed run is resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Sequence number within the run (0-indexed).
    pub number: usize,
    /// Proposal batch the configuration came from.
    pub batch: usize,
    pub configuration: Configuration,
    pub status: TrialStatus,
    pub objectives: Option<ObjectiveVector>,
    pub error: Option<TrialError>,
    /// Evaluation attempts made, retries included.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(number: usize, batch: usize, configuration: Configuration) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            batch,
            configuration,
            status: TrialStatus::Pending,
            objectives: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, allowed_from: &[TrialStatus], to: TrialStatus) -> Result<(), RunError> {
        if !allowed_from.contains(&self.status) {
            return Err(RunError::InvalidTransition {
                trial_id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), RunError> {
        self.transition(&[TrialStatus::Pending], TrialStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_succeeded(&mut self, objectives: ObjectiveVector, attempts: u32) -> Result<(), RunError> {
        self.transition(&[TrialStatus::Running], TrialStatus::Succeeded)?;
        self.objectives = Some(objectives);
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &EvaluationError, attempts: u32) -> Result<(), RunError> {
        self.transition(&[TrialStatus::Running], TrialStatus::Failed)?;
        self.error = Some(TrialError::from(error));
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), RunError> {
        self.transition(&[TrialStatus::Pending, TrialStatus::Running], TrialStatus::Cancelled)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Return a trial left running by a crashed process to the queue.
    pub fn requeue(&mut self) -> Result<(), RunError> {
        self.transition(&[TrialStatus::Running], TrialStatus::Pending)?;
        self.started_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_trial() -> Trial {
        Trial::new(0, 0, Configuration::from_values([("top_k", 5_i64)]))
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = sample_trial();
        assert_eq!(trial.status, TrialStatus::Pending);

        trial.mark_running().unwrap();
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(trial.started_at.is_some());

        let objectives = ObjectiveVector::new(0.8, dec!(0.02), 1.5).unwrap();
        trial.mark_succeeded(objectives, 1).unwrap();
        assert_eq!(trial.status, TrialStatus::Succeeded);
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.objectives.unwrap().accuracy, 0.8);
    }

    #[test]
    fn trial_failure() {
        let mut trial = sample_trial();
        trial.mark_running().unwrap();
        trial
            .mark_failed(&EvaluationError::Timeout { timeout_secs: 30.0 }, 3)
            .unwrap();
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.attempts, 3);
        assert_eq!(trial.error.as_ref().unwrap().reason, FailureReason::Timeout);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut trial = sample_trial();
        trial.mark_running().unwrap();
        trial.mark_cancelled().unwrap();

        assert!(trial.mark_running().is_err());
        assert!(trial.requeue().is_err());
        assert!(trial
            .mark_succeeded(ObjectiveVector::new(0.5, dec!(0), 0.0).unwrap(), 1)
            .is_err());
        assert_eq!(trial.status, TrialStatus::Cancelled);
    }

    #[test]
    fn running_trial_can_be_requeued() {
        let mut trial = sample_trial();
        assert!(trial.requeue().is_err());
        trial.mark_running().unwrap();
        trial.requeue().unwrap();
        assert_eq!(trial.status, TrialStatus::Pending);
        assert!(trial.started_at.is_none());
    }

    #[test]
    fn budget_accounting_by_status() {
        assert!(TrialStatus::Failed.counts_toward_budget());
        assert!(TrialStatus::Pending.counts_toward_budget());
        assert!(!TrialStatus::Cancelled.counts_toward_budget());
        assert!(!TrialStatus::Running.is_terminal());
    }
}
