//! Durable, resumable driver for one optimization run.
//!
//! The orchestrator owns the [`RunState`] and is its only writer. Evaluations
//! run as tokio tasks, at most `run.concurrency` at a time; their outcomes come
//! back to the single update path in [`JobOrchestrator::apply_outcome`], which
//! transitions the trial, persists it and then feeds the frontier and the
//! optimizer. Locks are never held across an await.
//!
//! Resumed runs re-queue trials that were running when the previous process
//! stopped. Such a trial may already have called external services, so a
//! resumed run executes trials at least once, not exactly once.

use std::sync::Arc;

use ar_optimizer::{Proposal, SurrogateOptimizer};
use ar_types::{
    internal_error, ArError, ArResult, ConfigSpace, Dimension, EvaluationError, ObjectiveVector,
    ObjectiveWeights, RunError, Trial, TrialId, TrialStatus,
};
use chrono::Utc;
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedEvaluator, ResultCache};
use crate::evaluator::{EvalSet, TrialEvaluator};
use crate::events::{EventSink, RunEvent};
use crate::run::{ProgressSnapshot, RunFailure, RunFailureKind, RunId, RunState, RunStatus};
use crate::settings::{EvaluationSettings, Settings};
use crate::store::{RunRecord, RunStore};

/// Result of one trial's evaluation task, retries included.
#[derive(Debug)]
struct TrialOutcome {
    trial_id: TrialId,
    attempts: u32,
    result: Result<ObjectiveVector, EvaluationError>,
}

/// Cloneable, thread-safe view of a run for status polling and cancellation.
#[derive(Clone)]
pub struct RunHandle {
    state: Arc<RwLock<RunState>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    weights: ObjectiveWeights,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.state.read().run_id
    }

    /// Request cooperative cancellation. In-flight evaluations are allowed to
    /// finish but their results are discarded.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.state.read().progress(&self.weights)
    }

    /// Full copy of the run state, trial history and frontier included.
    pub fn snapshot(&self) -> RunState {
        self.state.read().clone()
    }
}

pub struct JobOrchestrator {
    run_id: RunId,
    state: Arc<RwLock<RunState>>,
    optimizer: SurrogateOptimizer,
    evaluator: Arc<dyn TrialEvaluator>,
    eval_set: EvalSet,
    settings: Settings,
    store: Arc<dyn RunStore>,
    events: EventSink,
    cancel_tx: Arc<watch::Sender<bool>>,
    weights: ObjectiveWeights,
    resumed: bool,
}

impl JobOrchestrator {
    /// Validate inputs and persist a new run in `Created` status.
    pub fn create(
        name: &str,
        dimensions: Vec<Dimension>,
        eval_set: EvalSet,
        settings: Settings,
        evaluator: Arc<dyn TrialEvaluator>,
        store: Arc<dyn RunStore>,
    ) -> ArResult<Self> {
        settings.validate()?;
        let space = ConfigSpace::new(dimensions)?;
        warn_on_eval_set_size(&eval_set, &settings);

        let state = RunState::new(name, space, settings.run.budget);
        store.append(state.run_id, &RunRecord::header(&state))?;
        store.append(state.run_id, &RunRecord::status(&state))?;
        info!(
            run_id = %state.run_id,
            name,
            budget = state.budget,
            dimensions = state.config_space.dimensions().len(),
            "created optimization run"
        );

        Ok(Self::assemble(state, eval_set, settings, evaluator, store, false))
    }

    /// Reload a run from `store`. Trials left running are re-queued; runs in a
    /// terminal status are refused.
    pub fn resume(
        run_id: RunId,
        eval_set: EvalSet,
        settings: Settings,
        evaluator: Arc<dyn TrialEvaluator>,
        store: Arc<dyn RunStore>,
    ) -> ArResult<Self> {
        settings.validate()?;
        let mut state = store.load(run_id)?;
        if state.status.is_terminal() {
            return Err(RunError::AlreadyFinished {
                run_id: run_id.to_string(),
                status: state.status.to_string(),
            }
            .into());
        }
        warn_on_eval_set_size(&eval_set, &settings);

        let mut requeued = 0;
        for trial in state.trials.iter_mut() {
            if trial.status == TrialStatus::Running {
                trial.requeue()?;
                store.append(run_id, &RunRecord::trial(trial))?;
                requeued += 1;
            }
        }
        info!(
            run_id = %run_id,
            trials = state.trials.len(),
            succeeded = state.count(TrialStatus::Succeeded),
            requeued,
            "resuming optimization run"
        );

        Ok(Self::assemble(state, eval_set, settings, evaluator, store, true))
    }

    fn assemble(
        state: RunState,
        eval_set: EvalSet,
        settings: Settings,
        evaluator: Arc<dyn TrialEvaluator>,
        store: Arc<dyn RunStore>,
        resumed: bool,
    ) -> Self {
        let mut optimizer =
            SurrogateOptimizer::new(state.config_space.clone(), settings.surrogate.clone());
        optimizer.seed_from_history(&state.trials);

        let (cancel_tx, _) = watch::channel(false);
        Self {
            run_id: state.run_id,
            state: Arc::new(RwLock::new(state)),
            optimizer,
            evaluator,
            eval_set,
            settings,
            store,
            events: EventSink::disabled(),
            cancel_tx: Arc::new(cancel_tx),
            weights: ObjectiveWeights::default(),
            resumed,
        }
    }

    /// Publish [`RunEvent`]s on `tx` while the run progresses.
    pub fn with_events(mut self, tx: Sender<RunEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// Answer repeated configurations from `cache` instead of re-evaluating
    /// them. Share one cache between runs, or between a run and its resume,
    /// that use the same evaluation set.
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.evaluator = Arc::new(CachedEvaluator::with_cache(
            Arc::clone(&self.evaluator),
            cache,
        ));
        self
    }

    /// Weights used for the recommended point in progress reports.
    pub fn with_weights(mut self, weights: ObjectiveWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            state: Arc::clone(&self.state),
            cancel_tx: Arc::clone(&self.cancel_tx),
            weights: self.weights,
        }
    }

    pub fn state(&self) -> RunState {
        self.state.read().clone()
    }

    /// Drive the run to a terminal status.
    ///
    /// Returns `Completed` or `Cancelled`. Fatal conditions (too many failed
    /// trials, persistence failures) leave the run `Failed` and are returned
    /// as errors; the state remains inspectable through [`Self::handle`].
    pub async fn run(&mut self) -> ArResult<RunStatus> {
        let status = self.state.read().status;
        if status.is_terminal() {
            return Err(RunError::AlreadyFinished {
                run_id: self.run_id.to_string(),
                status: status.to_string(),
            }
            .into());
        }

        let mut join_set = JoinSet::new();
        let result = self.drive(&mut join_set).await;
        join_set.detach_all();

        if let Err(err) = &result {
            if !self.state.read().status.is_terminal() {
                let kind = match err {
                    ArError::Persistence(_) => RunFailureKind::Persistence,
                    _ => RunFailureKind::Internal,
                };
                error!(run_id = %self.run_id, error = %err, "optimization run failed");
                self.abandon_unfinished();
                self.finish_best_effort(RunStatus::Failed, Some(RunFailure {
                    kind,
                    message: err.to_string(),
                }));
            }
        }
        result
    }

    async fn drive(&mut self, join_set: &mut JoinSet<TrialOutcome>) -> ArResult<RunStatus> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        self.start()?;

        let mut search_finished = false;
        loop {
            if *cancel_rx.borrow_and_update() {
                return self.cancel(join_set);
            }
            self.check_failure_ratio()?;

            while join_set.len() < self.settings.run.concurrency {
                match self.next_pending() {
                    Some(trial_id) => self.dispatch(trial_id, join_set)?,
                    None => break,
                }
            }

            if join_set.is_empty() {
                if search_finished || !self.request_batch()? {
                    search_finished = true;
                    if self.next_pending().is_none() {
                        return self.finish(RunStatus::Completed);
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                changed = cancel_rx.changed() => {
                    if changed.is_err() {
                        return Err(internal_error!("cancellation channel closed"));
                    }
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => self.apply_outcome(outcome)?,
                        Some(Err(err)) => warn!(run_id = %self.run_id, error = %err, "evaluation task aborted"),
                        None => {}
                    }
                }
            }
        }
    }

    fn persist(&self, record: &RunRecord) -> ArResult<()> {
        Ok(self.store.append(self.run_id, record)?)
    }

    fn start(&mut self) -> ArResult<()> {
        let record = {
            let mut state = self.state.write();
            state.status = RunStatus::Running;
            state.finished_at = None;
            if state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
            RunRecord::status(&state)
        };
        self.persist(&record)?;
        self.events.emit(RunEvent::RunStarted {
            run_id: self.run_id,
            resumed: self.resumed,
        });
        info!(run_id = %self.run_id, resumed = self.resumed, "optimization run started");
        Ok(())
    }

    fn next_pending(&self) -> Option<TrialId> {
        self.state
            .read()
            .trials
            .iter()
            .find(|t| t.status == TrialStatus::Pending)
            .map(|t| t.id)
    }

    /// Ask the optimizer for the next batch and queue it as pending trials.
    /// Returns false once the search has nothing more to propose.
    fn request_batch(&mut self) -> ArResult<bool> {
        let (remaining, frontier, batch) = {
            let state = self.state.read();
            (state.remaining_budget(), state.frontier.clone(), state.next_batch())
        };

        let configs = match self
            .optimizer
            .propose(self.settings.run.batch_size, remaining, &frontier)
        {
            Proposal::Batch(configs) => configs,
            Proposal::Converged => {
                info!(run_id = %self.run_id, frontier_size = frontier.len(), "search converged");
                return Ok(false);
            }
            Proposal::BudgetExhausted => {
                info!(run_id = %self.run_id, "trial budget exhausted");
                return Ok(false);
            }
        };

        let mut queued = Vec::with_capacity(configs.len());
        {
            let mut state = self.state.write();
            for config in configs {
                if state.remaining_budget() == 0 {
                    break;
                }
                if let Err(err) = state.config_space.validate(&config) {
                    warn!(run_id = %self.run_id, config = %config, error = %err, "discarding invalid proposal");
                    self.events.emit(RunEvent::ProposalDiscarded {
                        configuration: config.to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
                let trial = Trial::new(state.next_trial_number(), batch, config);
                queued.push(trial.clone());
                state.trials.push(trial);
            }
        }
        if queued.is_empty() {
            warn!(run_id = %self.run_id, "optimizer proposed no usable configurations");
            return Ok(false);
        }

        for trial in &queued {
            self.persist(&RunRecord::trial(trial))?;
        }
        self.events.emit(RunEvent::BatchProposed {
            batch,
            size: queued.len(),
        });
        debug!(run_id = %self.run_id, batch, size = queued.len(), remaining, "queued proposal batch");
        Ok(true)
    }

    fn dispatch(&mut self, trial_id: TrialId, join_set: &mut JoinSet<TrialOutcome>) -> ArResult<()> {
        let trial = {
            let mut state = self.state.write();
            let trial = state
                .trial_mut(trial_id)
                .ok_or_else(|| internal_error!("unknown trial {}", trial_id))?;
            trial.mark_running()?;
            trial.clone()
        };
        self.persist(&RunRecord::trial(&trial))?;
        self.events.emit(RunEvent::TrialStarted {
            trial_id,
            number: trial.number,
        });
        debug!(run_id = %self.run_id, trial = trial.number, config = %trial.configuration, "dispatching trial");

        let evaluator = Arc::clone(&self.evaluator);
        let eval_set = self.eval_set.clone();
        let policy = self.settings.evaluation.clone();
        let events = self.events.clone();
        let config = trial.configuration;
        join_set.spawn(async move {
            // The inner task isolates evaluator panics from the join set.
            let task = tokio::spawn(async move {
                evaluate_with_retry(evaluator.as_ref(), &config, &eval_set, &policy, trial_id, &events)
                    .await
            });
            match task.await {
                Ok((attempts, result)) => TrialOutcome {
                    trial_id,
                    attempts,
                    result,
                },
                Err(err) => TrialOutcome {
                    trial_id,
                    attempts: 1,
                    result: Err(EvaluationError::Unknown {
                        message: format!("evaluation task failed: {err}"),
                    }),
                },
            }
        });
        Ok(())
    }

    /// The single update path: trial transition, persistence, frontier,
    /// optimizer. Runs to completion without suspending.
    fn apply_outcome(&mut self, outcome: TrialOutcome) -> ArResult<()> {
        let TrialOutcome {
            trial_id,
            attempts,
            result,
        } = outcome;

        let trial = {
            let mut state = self.state.write();
            let trial = state
                .trial_mut(trial_id)
                .ok_or_else(|| internal_error!("unknown trial {}", trial_id))?;
            if trial.status != TrialStatus::Running {
                debug!(run_id = %self.run_id, trial_id = %trial_id, status = %trial.status, "discarding late result");
                return Ok(());
            }
            match &result {
                Ok(objectives) => trial.mark_succeeded(*objectives, attempts)?,
                Err(err) => trial.mark_failed(err, attempts)?,
            }
            trial.clone()
        };
        self.persist(&RunRecord::trial(&trial))?;

        match (&trial.objectives, &result) {
            (Some(objectives), Ok(_)) => {
                let (inserted, frontier_size) = {
                    let mut state = self.state.write();
                    let inserted = state.frontier.insert(trial_id, *objectives);
                    (inserted, state.frontier.len())
                };
                if inserted.changed() {
                    self.events.emit(RunEvent::FrontierChanged {
                        size: frontier_size,
                        evicted: inserted.evicted.len(),
                    });
                }
                self.optimizer.observe(&trial.configuration, *objectives);
                info!(
                    run_id = %self.run_id,
                    trial = trial.number,
                    accuracy = objectives.accuracy,
                    cost = %objectives.cost,
                    latency = objectives.latency,
                    attempts,
                    on_frontier = inserted.accepted,
                    "trial succeeded"
                );
            }
            (_, Err(err)) => {
                warn!(
                    run_id = %self.run_id,
                    trial = trial.number,
                    attempts,
                    error = %err,
                    "trial failed"
                );
            }
            _ => {}
        }

        self.events.emit(RunEvent::TrialFinished {
            trial_id,
            status: trial.status,
        });
        Ok(())
    }

    fn check_failure_ratio(&mut self) -> ArResult<()> {
        let (failed, budget) = {
            let state = self.state.read();
            (state.count(TrialStatus::Failed), state.budget)
        };
        let ratio = self.settings.run.max_failure_ratio;
        if (failed as f64) <= ratio * budget as f64 {
            return Ok(());
        }

        let err = RunError::TooManyFailures {
            failed,
            budget,
            max_failure_ratio: ratio,
        };
        error!(run_id = %self.run_id, failed, budget, "too many failed trials, stopping run");
        for trial in self.abandon_unfinished() {
            self.persist(&RunRecord::trial(&trial))?;
        }
        self.finish_with(
            RunStatus::Failed,
            Some(RunFailure {
                kind: RunFailureKind::TooManyFailures,
                message: err.to_string(),
            }),
        )?;
        Err(err.into())
    }

    fn cancel(&mut self, join_set: &mut JoinSet<TrialOutcome>) -> ArResult<RunStatus> {
        let in_flight = join_set.len();
        join_set.detach_all();
        info!(run_id = %self.run_id, in_flight, "cancelling optimization run");
        for trial in self.abandon_unfinished() {
            self.persist(&RunRecord::trial(&trial))?;
        }
        self.finish(RunStatus::Cancelled)
    }

    /// Cancel every pending or running trial in memory and return the
    /// changed trials.
    fn abandon_unfinished(&mut self) -> Vec<Trial> {
        let mut state = self.state.write();
        let mut changed = Vec::new();
        for trial in state.trials.iter_mut() {
            if matches!(trial.status, TrialStatus::Pending | TrialStatus::Running)
                && trial.mark_cancelled().is_ok()
            {
                changed.push(trial.clone());
            }
        }
        changed
    }

    fn finish(&mut self, status: RunStatus) -> ArResult<RunStatus> {
        self.finish_with(status, None)?;
        Ok(status)
    }

    fn finish_with(&mut self, status: RunStatus, failure: Option<RunFailure>) -> ArResult<()> {
        let record = self.set_terminal(status, failure);
        self.persist(&record)?;
        self.log_finish(status);
        Ok(())
    }

    /// Used after a fatal error, when the store may itself be the problem.
    fn finish_best_effort(&mut self, status: RunStatus, failure: Option<RunFailure>) {
        let record = self.set_terminal(status, failure);
        if let Err(err) = self.persist(&record) {
            warn!(run_id = %self.run_id, error = %err, "could not persist final run status");
        }
        self.log_finish(status);
    }

    fn set_terminal(&mut self, status: RunStatus, failure: Option<RunFailure>) -> RunRecord {
        let mut state = self.state.write();
        state.status = status;
        state.failure = failure;
        state.finished_at = Some(Utc::now());
        RunRecord::status(&state)
    }

    fn log_finish(&self, status: RunStatus) {
        let progress = self.state.read().progress(&self.weights);
        self.events.emit(RunEvent::RunFinished {
            run_id: self.run_id,
            status,
        });
        info!(
            run_id = %self.run_id,
            status = %status,
            succeeded = progress.trials_succeeded,
            failed = progress.trials_failed,
            frontier_size = progress.current_frontier_size,
            elapsed_secs = progress.elapsed_secs,
            "optimization run finished"
        );
    }
}

fn warn_on_eval_set_size(eval_set: &EvalSet, settings: &Settings) {
    if eval_set.len() != settings.run.test_questions {
        warn!(
            items = eval_set.len(),
            expected = settings.run.test_questions,
            "evaluation set size differs from run.test_questions"
        );
    }
}

/// Evaluate with a hard timeout per attempt, retrying transient failures with
/// exponential backoff. Returns the number of attempts made.
async fn evaluate_with_retry(
    evaluator: &dyn TrialEvaluator,
    config: &ar_types::Configuration,
    eval_set: &EvalSet,
    policy: &EvaluationSettings,
    trial_id: TrialId,
    events: &EventSink,
) -> (u32, Result<ObjectiveVector, EvaluationError>) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout(), evaluator.evaluate(config, eval_set)).await
        {
            Ok(result) => result,
            Err(_) => Err(EvaluationError::Timeout {
                timeout_secs: policy.timeout_secs,
            }),
        };

        match result {
            Ok(objectives) => return (attempt, Ok(objectives)),
            Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                let delay = policy.backoff(attempt);
                debug!(
                    trial_id = %trial_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient evaluation failure"
                );
                events.emit(RunEvent::TrialRetrying {
                    trial_id,
                    attempt,
                    reason: err.reason(),
                });
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (attempt, Err(err)),
        }
    }
}
