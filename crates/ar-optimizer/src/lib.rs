//! Search machinery for the AutoRAG optimizer: the Pareto frontier over
//! (accuracy, cost, latency) and the surrogate-model optimizer that proposes
//! configurations to evaluate next.

pub mod pareto;
pub mod search;
pub mod surrogate;

pub use pareto::{FrontierPoint, InsertOutcome, ParetoFrontier};
pub use search::{OptimizerPhase, Proposal, SurrogateOptimizer, SurrogateSettings};
pub use surrogate::{expected_improvement, GaussianProcess};
