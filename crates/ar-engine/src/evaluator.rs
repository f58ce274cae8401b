//! Trial evaluation contract and the standard pipeline-backed evaluator.
//!
//! An evaluator runs one configuration against the fixed evaluation set and
//! reports an [`ObjectiveVector`]. Evaluations call external services, so the
//! same configuration may score slightly differently on every call.

use std::sync::Arc;

use ar_types::{ArResult, Configuration, EvaluationError, ObjectiveVector, RunError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// One question with its reference answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalItem {
    pub question: String,
    pub reference_answer: String,
}

impl EvalItem {
    pub fn new(question: impl Into<String>, reference_answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            reference_answer: reference_answer.into(),
        }
    }
}

/// Fixed, non-empty, ordered evaluation set shared by every trial of a run.
/// Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalSet {
    items: Arc<[EvalItem]>,
}

impl EvalSet {
    pub fn new(items: Vec<EvalItem>) -> ArResult<Self> {
        if items.is_empty() {
            return Err(RunError::EmptyEvaluationSet.into());
        }
        Ok(Self {
            items: items.into(),
        })
    }

    pub fn from_pairs<I, Q, A>(pairs: I) -> ArResult<Self>
    where
        I: IntoIterator<Item = (Q, A)>,
        Q: Into<String>,
        A: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(q, a)| EvalItem::new(q, a)).collect())
    }

    pub fn items(&self) -> &[EvalItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false: construction rejects empty sets.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Runs a single configuration against the evaluation set.
///
/// Implementations must not enforce the trial timeout themselves; the
/// orchestrator wraps every attempt in a hard wall-clock limit.
#[async_trait]
pub trait TrialEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        config: &Configuration,
        eval_set: &EvalSet,
    ) -> Result<ObjectiveVector, EvaluationError>;
}

#[async_trait]
impl<T: TrialEvaluator + ?Sized> TrialEvaluator for Arc<T> {
    async fn evaluate(
        &self,
        config: &Configuration,
        eval_set: &EvalSet,
    ) -> Result<ObjectiveVector, EvaluationError> {
        (**self).evaluate(config, eval_set).await
    }
}

/// Response of a built pipeline to one question.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAnswer {
    pub answer: String,
    /// Retrieved context passages the answer was grounded on.
    pub contexts: Vec<String>,
    /// Monetary cost of producing this answer.
    pub cost: Decimal,
}

/// An answerable query interface built from one configuration.
#[async_trait]
pub trait QueryPipeline: Send + Sync {
    async fn query(&self, question: &str) -> Result<PipelineAnswer, EvaluationError>;
}

/// Builds a retrieval pipeline for a configuration.
#[async_trait]
pub trait PipelineBuilder: Send + Sync {
    async fn build(&self, config: &Configuration) -> Result<Box<dyn QueryPipeline>, EvaluationError>;
}

/// Scores an answer against its reference. Scores must lie in `[0, 1]`.
#[async_trait]
pub trait AccuracyScorer: Send + Sync {
    async fn score(&self, item: &EvalItem, answer: &PipelineAnswer) -> Result<f64, EvaluationError>;
}

/// Evaluator composed from a pipeline builder and an accuracy scorer.
///
/// Accuracy is the mean score over the set, cost the summed per-query cost and
/// latency the mean wall-clock seconds per query (scoring excluded).
pub struct PipelineEvaluator<B, S> {
    builder: B,
    scorer: S,
}

impl<B: PipelineBuilder, S: AccuracyScorer> PipelineEvaluator<B, S> {
    pub fn new(builder: B, scorer: S) -> Self {
        Self { builder, scorer }
    }
}

#[async_trait]
impl<B: PipelineBuilder, S: AccuracyScorer> TrialEvaluator for PipelineEvaluator<B, S> {
    async fn evaluate(
        &self,
        config: &Configuration,
        eval_set: &EvalSet,
    ) -> Result<ObjectiveVector, EvaluationError> {
        let pipeline = self.builder.build(config).await?;

        let mut total_score = 0.0;
        let mut total_cost = Decimal::ZERO;
        let mut total_latency = 0.0;
        for item in eval_set.items() {
            let started = Instant::now();
            let answer = pipeline.query(&item.question).await?;
            total_latency += started.elapsed().as_secs_f64();

            let score = self.scorer.score(item, &answer).await?;
            if !(0.0..=1.0).contains(&score) {
                return Err(EvaluationError::Unknown {
                    message: format!("accuracy scorer returned {score}, expected a value in [0, 1]"),
                });
            }
            total_score += score;
            total_cost += answer.cost;
        }

        let n = eval_set.len() as f64;
        let objectives = ObjectiveVector::new(total_score / n, total_cost, total_latency / n)?;
        debug!(
            config = %config,
            accuracy = objectives.accuracy,
            cost = %objectives.cost,
            latency = objectives.latency,
            "evaluated configuration"
        );
        Ok(objectives)
    }
}
