//! Run orchestration for the AutoRAG optimizer.
//!
//! [`JobOrchestrator`] drives an optimization run: it asks the surrogate
//! optimizer for configurations, evaluates them concurrently through a
//! [`TrialEvaluator`], records every trial transition in a [`RunStore`] and
//! maintains the Pareto frontier. Runs can be cancelled through a
//! [`RunHandle`] and resumed from their journal after a crash.

pub mod cache;
pub mod evaluator;
pub mod events;
pub mod orchestrator;
pub mod run;
pub mod settings;
pub mod store;

pub use cache::{CacheStats, CachedEvaluator, ResultCache};
pub use evaluator::{
    AccuracyScorer, EvalItem, EvalSet, PipelineAnswer, PipelineBuilder, PipelineEvaluator,
    QueryPipeline, TrialEvaluator,
};
pub use events::{EventSink, RunEvent};
pub use orchestrator::{JobOrchestrator, RunHandle};
pub use run::{ProgressSnapshot, RunFailure, RunFailureKind, RunId, RunState, RunStatus};
pub use settings::{default_run_dir, EvaluationSettings, RunSettings, Settings, StorageSettings};
pub use store::{replay, JournalStore, MemoryStore, RunRecord, RunStore};
