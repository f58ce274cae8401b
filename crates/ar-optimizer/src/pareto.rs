//! Incrementally maintained Pareto frontier over (accuracy, cost, latency).
//!
//! The frontier holds exactly the succeeded trials that no other succeeded
//! trial dominates. Insertion is a linear scan over the current members,
//! which is plenty for runs of a few dozen trials.

use ar_types::{ObjectiveVector, ObjectiveWeights, Trial, TrialId, TrialStatus};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// A trial that is currently non-dominated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub trial_id: TrialId,
    pub objectives: ObjectiveVector,
}

/// Result of [`ParetoFrontier::insert`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertOutcome {
    /// The new point joined the frontier.
    pub accepted: bool,
    /// Members removed because the new point dominates them.
    pub evicted: Vec<TrialId>,
}

impl InsertOutcome {
    pub fn changed(&self) -> bool {
        self.accepted || !self.evicted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParetoFrontier {
    points: Vec<FrontierPoint>,
    /// Bumped on every membership change.
    revision: u64,
}

impl ParetoFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the frontier from a trial history, in trial order.
    pub fn from_trials<'a>(trials: impl IntoIterator<Item = &'a Trial>) -> Self {
        let mut frontier = Self::new();
        for trial in trials {
            if trial.status != TrialStatus::Succeeded {
                continue;
            }
            if let Some(objectives) = trial.objectives {
                frontier.insert(trial.id, objectives);
            }
        }
        frontier
    }

    pub fn points(&self) -> &[FrontierPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, trial_id: TrialId) -> bool {
        self.points.iter().any(|p| p.trial_id == trial_id)
    }

    /// Add a succeeded trial unless an existing member dominates it; on
    /// acceptance, evict every member the new point dominates.
    pub fn insert(&mut self, trial_id: TrialId, objectives: ObjectiveVector) -> InsertOutcome {
        if self.contains(trial_id) {
            return InsertOutcome::default();
        }
        if self.points.iter().any(|p| p.objectives.dominates(&objectives)) {
            return InsertOutcome::default();
        }

        let mut evicted = Vec::new();
        self.points.retain(|p| {
            if objectives.dominates(&p.objectives) {
                evicted.push(p.trial_id);
                false
            } else {
                true
            }
        });
        self.points.push(FrontierPoint {
            trial_id,
            objectives,
        });
        self.revision += 1;

        InsertOutcome {
            accepted: true,
            evicted,
        }
    }

    /// Frontier members sorted by descending weighted score.
    ///
    /// Cost and latency are min-max normalized over the current frontier and
    /// inverted so that 1.0 is best; accuracy is used as-is. A zero-width
    /// range normalizes to 0 (every member gets full credit). Weights are
    /// normalized to sum to one. Ties keep insertion order.
    pub fn rank(&self, weights: &ObjectiveWeights) -> Vec<&FrontierPoint> {
        let scores = self.scores(weights);
        let mut order: Vec<usize> = (0..self.points.len()).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.into_iter().map(|i| &self.points[i]).collect()
    }

    /// The single top-ranked member, used as the default recommendation.
    pub fn best_by(&self, weights: &ObjectiveWeights) -> Option<&FrontierPoint> {
        self.rank(weights).into_iter().next()
    }

    fn scores(&self, weights: &ObjectiveWeights) -> Vec<f64> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let w = weights.normalized();
        let costs: Vec<f64> = self
            .points
            .iter()
            .map(|p| p.objectives.cost.to_f64().unwrap_or(f64::MAX))
            .collect();
        let latencies: Vec<f64> = self.points.iter().map(|p| p.objectives.latency).collect();
        let (cost_lo, cost_hi) = bounds(&costs);
        let (lat_lo, lat_hi) = bounds(&latencies);

        self.points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let cost_norm = min_max(costs[i], cost_lo, cost_hi);
                let lat_norm = min_max(latencies[i], lat_lo, lat_hi);
                w.accuracy * p.objectives.accuracy
                    + w.cost * (1.0 - cost_norm)
                    + w.latency * (1.0 - lat_norm)
            })
            .collect()
    }
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn min_max(value: f64, lo: f64, hi: f64) -> f64 {
    if hi - lo <= 0.0 {
        0.0
    } else {
        (value - lo) / (hi - lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::Configuration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn obj(accuracy: f64, cost: Decimal, latency: f64) -> ObjectiveVector {
        ObjectiveVector::new(accuracy, cost, latency).unwrap()
    }

    fn assert_antichain(frontier: &ParetoFrontier) {
        for a in frontier.points() {
            for b in frontier.points() {
                assert!(
                    !a.objectives.dominates(&b.objectives),
                    "{:?} dominates {:?}",
                    a.objectives,
                    b.objectives
                );
            }
        }
    }

    #[test]
    fn dominated_insert_leaves_frontier_unchanged() {
        let mut frontier = ParetoFrontier::new();
        frontier.insert(Uuid::new_v4(), obj(0.9, dec!(0.10), 1.0));
        let before = frontier.clone();

        let outcome = frontier.insert(Uuid::new_v4(), obj(0.8, dec!(0.20), 1.5));
        assert!(!outcome.accepted);
        assert!(!outcome.changed());
        assert_eq!(frontier, before);
    }

    #[test]
    fn dominating_insert_evicts_exactly_the_dominated() {
        let mut frontier = ParetoFrontier::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        frontier.insert(a, obj(0.70, dec!(0.10), 2.0));
        frontier.insert(b, obj(0.60, dec!(0.05), 3.0));
        frontier.insert(c, obj(0.95, dec!(0.90), 0.5));
        assert_eq!(frontier.len(), 3);

        let d = Uuid::new_v4();
        let outcome = frontier.insert(d, obj(0.75, dec!(0.05), 1.5));
        assert!(outcome.accepted);
        let mut evicted = outcome.evicted.clone();
        evicted.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(frontier.len(), 2);
        assert!(frontier.contains(c));
        assert!(frontier.contains(d));
        assert_antichain(&frontier);
    }

    #[test]
    fn identical_vectors_both_remain() {
        let mut frontier = ParetoFrontier::new();
        frontier.insert(Uuid::new_v4(), obj(0.8, dec!(0.10), 1.0));
        let outcome = frontier.insert(Uuid::new_v4(), obj(0.8, dec!(0.10), 1.0));
        assert!(outcome.accepted);
        assert!(outcome.evicted.is_empty());
        assert_eq!(frontier.len(), 2);
    }

    #[test]
    fn revision_tracks_changes_only() {
        let mut frontier = ParetoFrontier::new();
        let id = Uuid::new_v4();
        frontier.insert(id, obj(0.8, dec!(0.10), 1.0));
        assert_eq!(frontier.revision(), 1);
        frontier.insert(Uuid::new_v4(), obj(0.1, dec!(1.0), 9.0));
        assert_eq!(frontier.revision(), 1);
        // Re-inserting the same trial is a no-op.
        frontier.insert(id, obj(0.8, dec!(0.10), 1.0));
        assert_eq!(frontier.revision(), 1);
    }

    #[test]
    fn antichain_holds_over_many_inserts() {
        let mut frontier = ParetoFrontier::new();
        for i in 0..40u32 {
            let accuracy = f64::from((i * 37) % 101) / 100.0;
            let cost = Decimal::from((i * 53) % 17) / dec!(100);
            let latency = f64::from((i * 29) % 13) / 4.0;
            frontier.insert(Uuid::new_v4(), obj(accuracy, cost, latency));
            assert_antichain(&frontier);
        }
    }

    #[test]
    fn rank_normalizes_cost_and_latency() {
        let mut frontier = ParetoFrontier::new();
        let accurate = Uuid::new_v4();
        let cheap = Uuid::new_v4();
        let fast = Uuid::new_v4();
        frontier.insert(accurate, obj(0.95, dec!(1.00), 4.0));
        frontier.insert(cheap, obj(0.60, dec!(0.01), 3.0));
        frontier.insert(fast, obj(0.70, dec!(0.50), 0.2));

        let accuracy_only = ObjectiveWeights::new(1.0, 0.0, 0.0);
        assert_eq!(frontier.best_by(&accuracy_only).unwrap().trial_id, accurate);

        let cost_only = ObjectiveWeights::new(0.0, 1.0, 0.0);
        assert_eq!(frontier.best_by(&cost_only).unwrap().trial_id, cheap);

        let latency_only = ObjectiveWeights::new(0.0, 0.0, 1.0);
        let ranked: Vec<TrialId> = frontier
            .rank(&latency_only)
            .iter()
            .map(|p| p.trial_id)
            .collect();
        assert_eq!(ranked, vec![fast, cheap, accurate]);
    }

    #[test]
    fn rank_ties_keep_insertion_order() {
        let mut frontier = ParetoFrontier::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        frontier.insert(first, obj(0.8, dec!(0.10), 1.0));
        frontier.insert(second, obj(0.8, dec!(0.10), 1.0));
        let ranked = frontier.rank(&ObjectiveWeights::default());
        assert_eq!(ranked[0].trial_id, first);
        assert_eq!(ranked[1].trial_id, second);
    }

    #[test]
    fn best_by_on_empty_frontier() {
        assert!(ParetoFrontier::new()
            .best_by(&ObjectiveWeights::default())
            .is_none());
    }

    #[test]
    fn rebuilt_from_succeeded_trials_only() {
        let config = Configuration::from_values([("top_k", 3_i64)]);
        let mut good = Trial::new(0, 0, config.clone());
        good.mark_running().unwrap();
        good.mark_succeeded(obj(0.9, dec!(0.1), 1.0), 1).unwrap();

        let mut worse = Trial::new(1, 0, config.clone());
        worse.mark_running().unwrap();
        worse.mark_succeeded(obj(0.5, dec!(0.2), 2.0), 1).unwrap();

        let pending = Trial::new(2, 0, config);

        let frontier = ParetoFrontier::from_trials([&good, &worse, &pending]);
        assert_eq!(frontier.len(), 1);
        assert!(frontier.contains(good.id));
    }
}
