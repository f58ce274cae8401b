use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::EvaluationError;

/// Outcome of a trial: higher accuracy, lower cost and lower latency are each
/// better. There is no total order across the three without weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveVector {
    /// Mean accuracy score over the evaluation set, in [0, 1].
    pub accuracy: f64,
    /// Currency units spent per evaluation run.
    pub cost: Decimal,
    /// Mean seconds per query over the evaluation set.
    pub latency: f64,
}

impl ObjectiveVector {
    /// Validate raw evaluator output.
    pub fn new(accuracy: f64, cost: Decimal, latency: f64) -> Result<Self, EvaluationError> {
        if !accuracy.is_finite() || !(0.0..=1.0).contains(&accuracy) {
            return Err(EvaluationError::Unknown {
                message: format!("accuracy {accuracy} is outside [0, 1]"),
            });
        }
        if cost.is_sign_negative() && !cost.is_zero() {
            return Err(EvaluationError::Unknown {
                message: format!("cost {cost} is negative"),
            });
        }
        if !latency.is_finite() || latency < 0.0 {
            return Err(EvaluationError::Unknown {
                message: format!("latency {latency} is negative or not finite"),
            });
        }
        Ok(Self {
            accuracy,
            cost,
            latency,
        })
    }

    /// `self` dominates `other` when it is at least as good on every objective
    /// and strictly better on at least one.
    pub fn dominates(&self, other: &ObjectiveVector) -> bool {
        let no_worse = self.accuracy >= other.accuracy
            && self.cost <= other.cost
            && self.latency <= other.latency;
        let strictly_better = self.accuracy > other.accuracy
            || self.cost < other.cost
            || self.latency < other.latency;
        no_worse && strictly_better
    }
}

/// Relative importance of each objective when a single answer is needed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    pub accuracy: f64,
    pub cost: f64,
    pub latency: f64,
}

impl ObjectiveWeights {
    pub fn new(accuracy: f64, cost: f64, latency: f64) -> Self {
        Self {
            accuracy,
            cost,
            latency,
        }
    }

    /// Weights scaled to sum to one. Negative or non-finite weights are
    /// treated as zero; all-zero weights become uniform.
    pub fn normalized(&self) -> Self {
        let clean = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let (a, c, l) = (clean(self.accuracy), clean(self.cost), clean(self.latency));
        let total = a + c + l;
        if total == 0.0 {
            return Self::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0);
        }
        Self::new(a / total, c / total, l / total)
    }
}

impl Default for ObjectiveWeights {
    /// Accuracy first, cost and latency sharing the rest.
    fn default() -> Self {
        Self::new(0.5, 0.25, 0.25)
    }
}
