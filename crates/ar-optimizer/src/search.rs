//! Sequential model-based search over a [`ConfigSpace`].
//!
//! The optimizer alternates between proposing batches of configurations and
//! absorbing observed objective vectors:
//!
//! ```text
//! Idle -> Proposing -> WaitingForResults -> Updating -> Proposing ...
//!                                                    -> Converged | BudgetExhausted
//! ```
//!
//! The first round is a random initial design. Later rounds fit one Gaussian
//! process per objective and pick, for each batch slot, the candidate with the
//! highest scalarized expected improvement under a rotating weight triple.
//! Ties go to the candidate farthest from anything already proposed.

use std::collections::HashSet;

use ar_types::{ConfigSpace, Configuration, ObjectiveVector, Trial, TrialStatus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pareto::ParetoFrontier;
use crate::surrogate::{expected_improvement, GaussianProcess};

/// Objective weight triples (accuracy, cost, latency) cycled across batch
/// slots so one batch explores several trade-offs.
const WEIGHT_CYCLE: [[f64; 3]; 7] = [
    [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0],
    [0.6, 0.2, 0.2],
    [0.2, 0.6, 0.2],
    [0.2, 0.2, 0.6],
    [0.5, 0.5, 0.0],
    [0.5, 0.0, 0.5],
    [0.0, 0.5, 0.5],
];

/// Random draws per slot before giving up on finding a novel configuration.
const RANDOM_ATTEMPTS_PER_SLOT: usize = 64;
const EI_TIE_TOLERANCE: f64 = 1e-12;

/// Tuning knobs for [`SurrogateOptimizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateSettings {
    /// Size of the random initial design.
    pub initial_design: usize,
    /// Random candidates scored per acquisition round.
    pub candidates: usize,
    /// Acquisition rounds to retry when every candidate was already seen.
    pub resample_limit: usize,
    /// Consecutive proposal rounds without a frontier change before the
    /// search reports convergence. Zero disables the check.
    pub convergence_patience: usize,
    /// Observation noise added to the kernel diagonal (standardized units).
    pub noise_variance: f64,
    /// Fixed RNG seed for reproducible proposals.
    pub seed: Option<u64>,
}

impl Default for SurrogateSettings {
    fn default() -> Self {
        Self {
            initial_design: 5,
            candidates: 512,
            resample_limit: 8,
            convergence_patience: 5,
            noise_variance: 1e-2,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerPhase {
    Idle,
    Proposing,
    WaitingForResults,
    Updating,
    Converged,
    BudgetExhausted,
}

/// Answer to [`SurrogateOptimizer::propose`].
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// Mutually distinct, never-before-proposed configurations.
    Batch(Vec<Configuration>),
    Converged,
    BudgetExhausted,
}

#[derive(Debug, Clone)]
struct Observation {
    encoded: Vec<f64>,
    objectives: ObjectiveVector,
}

pub struct SurrogateOptimizer {
    space: ConfigSpace,
    settings: SurrogateSettings,
    rng: StdRng,
    phase: OptimizerPhase,
    observations: Vec<Observation>,
    observed_keys: HashSet<String>,
    /// Keys of every configuration proposed or dispatched so far.
    seen: HashSet<String>,
    seen_encoded: Vec<Vec<f64>>,
    rounds: usize,
    last_frontier_revision: Option<u64>,
    stale_rounds: usize,
    weight_cursor: usize,
}

impl SurrogateOptimizer {
    pub fn new(space: ConfigSpace, settings: SurrogateSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            space,
            settings,
            rng,
            phase: OptimizerPhase::Idle,
            observations: Vec::new(),
            observed_keys: HashSet::new(),
            seen: HashSet::new(),
            seen_encoded: Vec::new(),
            rounds: 0,
            last_frontier_revision: None,
            stale_rounds: 0,
            weight_cursor: 0,
        }
    }

    pub fn space(&self) -> &ConfigSpace {
        &self.space
    }

    pub fn phase(&self) -> OptimizerPhase {
        self.phase
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Number of distinct configurations with at least one observation.
    pub fn distinct_observations(&self) -> usize {
        self.observed_keys.len()
    }

    pub fn has_seen(&self, config: &Configuration) -> bool {
        self.seen.contains(&config.key())
    }

    /// Restore state from a persisted trial history. Succeeded trials become
    /// observations; every non-cancelled trial counts as already proposed.
    pub fn seed_from_history<'a>(&mut self, trials: impl IntoIterator<Item = &'a Trial>) {
        for trial in trials {
            if trial.status == TrialStatus::Cancelled {
                continue;
            }
            self.register_dispatched(&trial.configuration);
            if let (TrialStatus::Succeeded, Some(objectives)) = (trial.status, trial.objectives) {
                self.observe(&trial.configuration, objectives);
            }
        }
    }

    /// Mark a configuration as proposed so it is never suggested again.
    pub fn register_dispatched(&mut self, config: &Configuration) {
        if self.seen.insert(config.key()) {
            if let Ok(encoded) = self.space.encode(config) {
                self.seen_encoded.push(encoded);
            }
        }
    }

    /// Record a successful evaluation. Failed trials must not be observed.
    pub fn observe(&mut self, config: &Configuration, objectives: ObjectiveVector) {
        let previous = self.phase;
        self.phase = OptimizerPhase::Updating;
        match self.space.encode(config) {
            Ok(encoded) => {
                self.register_dispatched(config);
                self.observed_keys.insert(config.key());
                self.observations.push(Observation {
                    encoded,
                    objectives,
                });
            }
            Err(err) => warn!(error = %err, "ignoring observation for invalid configuration"),
        }
        self.phase = match previous {
            OptimizerPhase::Converged | OptimizerPhase::BudgetExhausted => previous,
            _ => OptimizerPhase::WaitingForResults,
        };
    }

    /// Propose up to `max_batch` new configurations (the first round uses the
    /// initial design size instead), never more than `remaining_budget`.
    pub fn propose(
        &mut self,
        max_batch: usize,
        remaining_budget: usize,
        frontier: &ParetoFrontier,
    ) -> Proposal {
        if remaining_budget == 0 {
            self.phase = OptimizerPhase::BudgetExhausted;
            return Proposal::BudgetExhausted;
        }
        if self.phase == OptimizerPhase::Converged {
            return Proposal::Converged;
        }

        let revision = frontier.revision();
        if self.rounds > 0 && self.last_frontier_revision == Some(revision) {
            self.stale_rounds += 1;
        } else {
            self.stale_rounds = 0;
        }
        self.last_frontier_revision = Some(revision);

        let patience = self.settings.convergence_patience;
        if patience > 0 && self.stale_rounds >= patience {
            info!(
                stale_rounds = self.stale_rounds,
                frontier_size = frontier.len(),
                "frontier unchanged, search converged"
            );
            self.phase = OptimizerPhase::Converged;
            return Proposal::Converged;
        }

        self.phase = OptimizerPhase::Proposing;
        let in_initial_design =
            self.rounds == 0 && self.observations.len() < self.settings.initial_design;
        let requested = if in_initial_design {
            self.settings.initial_design - self.observations.len()
        } else {
            max_batch
        };
        let size = requested.max(1).min(remaining_budget);

        let batch = if in_initial_design || self.distinct_observations() < 2 {
            debug!(size, "proposing random batch");
            self.random_batch(size)
        } else {
            self.model_batch(size)
        };
        self.rounds += 1;

        if batch.is_empty() {
            info!("no unseen configurations remain, search converged");
            self.phase = OptimizerPhase::Converged;
            return Proposal::Converged;
        }
        self.phase = OptimizerPhase::WaitingForResults;
        Proposal::Batch(batch)
    }

    fn space_exhausted(&self) -> bool {
        self.space
            .grid_size()
            .is_some_and(|size| self.seen.len() as u64 >= size)
    }

    fn random_batch(&mut self, size: usize) -> Vec<Configuration> {
        let mut batch = Vec::with_capacity(size);
        for _ in 0..size {
            match self.random_novel() {
                Some(config) => batch.push(config),
                None => break,
            }
        }
        batch
    }

    fn random_novel(&mut self) -> Option<Configuration> {
        for _ in 0..RANDOM_ATTEMPTS_PER_SLOT {
            if self.space_exhausted() {
                return None;
            }
            let config = self.space.sample_random(&mut self.rng);
            if !self.has_seen(&config) {
                self.register_dispatched(&config);
                return Some(config);
            }
        }
        None
    }

    fn model_batch(&mut self, size: usize) -> Vec<Configuration> {
        let Some(models) = self.fit_models() else {
            warn!("surrogate fit failed, falling back to random sampling");
            return self.random_batch(size);
        };

        let mut batch = Vec::with_capacity(size);
        for _ in 0..size {
            let weights = WEIGHT_CYCLE[self.weight_cursor % WEIGHT_CYCLE.len()];
            self.weight_cursor += 1;

            let proposal = self
                .acquire(&models, weights)
                .or_else(|| self.random_novel());
            match proposal {
                Some(config) => batch.push(config),
                None => break,
            }
        }
        debug!(size = batch.len(), "proposing model-guided batch");
        batch
    }

    /// One GP per objective, each fit on a utility in [0, 1] where larger is
    /// better (cost and latency are inverted).
    fn fit_models(&self) -> Option<Models> {
        let x: Vec<Vec<f64>> = self.observations.iter().map(|o| o.encoded.clone()).collect();
        let accuracy: Vec<f64> = self.observations.iter().map(|o| o.objectives.accuracy).collect();
        let cost: Vec<f64> = self
            .observations
            .iter()
            .map(|o| o.objectives.cost.to_f64().unwrap_or(f64::MAX))
            .collect();
        let latency: Vec<f64> = self.observations.iter().map(|o| o.objectives.latency).collect();

        let utilities = [
            utility(&accuracy, false),
            utility(&cost, true),
            utility(&latency, true),
        ];
        let noise = self.settings.noise_variance;
        let gps = [
            GaussianProcess::fit(&x, &utilities[0], noise)?,
            GaussianProcess::fit(&x, &utilities[1], noise)?,
            GaussianProcess::fit(&x, &utilities[2], noise)?,
        ];
        Some(Models { gps, utilities })
    }

    /// Pick the best unseen candidate under `weights`, resampling the
    /// candidate pool up to `resample_limit` times.
    fn acquire(&mut self, models: &Models, weights: [f64; 3]) -> Option<Configuration> {
        let best_observed = (0..self.observations.len())
            .map(|i| {
                weights[0] * models.utilities[0][i]
                    + weights[1] * models.utilities[1][i]
                    + weights[2] * models.utilities[2][i]
            })
            .fold(f64::NEG_INFINITY, f64::max);

        let dims = self.space.encoded_len();
        for round in 0..self.settings.resample_limit.max(1) {
            let mut pool: Vec<(Configuration, Vec<f64>)> = Vec::new();
            let mut pool_keys = HashSet::new();
            for _ in 0..self.settings.candidates.max(1) {
                let raw: Vec<f64> = (0..dims).map(|_| self.rng.random::<f64>()).collect();
                let Ok(config) = self.space.decode(&raw) else {
                    continue;
                };
                let key = config.key();
                if self.seen.contains(&key) || !pool_keys.insert(key) {
                    continue;
                }
                if let Ok(encoded) = self.space.encode(&config) {
                    pool.push((config, encoded));
                }
            }
            if pool.is_empty() {
                debug!(round, "every candidate was already seen, resampling");
                continue;
            }

            let seen_encoded = &self.seen_encoded;
            let scored: Vec<(f64, f64)> = pool
                .par_iter()
                .map(|(_, encoded)| {
                    let mut mean = 0.0;
                    let mut var = 0.0;
                    for (w, gp) in weights.iter().zip(&models.gps) {
                        let (mu, sigma) = gp.predict(encoded);
                        mean += w * mu;
                        var += w * w * sigma * sigma;
                    }
                    let ei = expected_improvement(mean, var.sqrt(), best_observed);
                    let ei = if ei.is_finite() { ei } else { 0.0 };
                    (ei, nearest_distance(encoded, seen_encoded))
                })
                .collect();

            let mut best = 0;
            for i in 1..scored.len() {
                let (ei, dist) = scored[i];
                let (best_ei, best_dist) = scored[best];
                if ei > best_ei + EI_TIE_TOLERANCE
                    || ((ei - best_ei).abs() <= EI_TIE_TOLERANCE && dist > best_dist)
                {
                    best = i;
                }
            }

            let (config, _) = pool.swap_remove(best);
            self.register_dispatched(&config);
            return Some(config);
        }
        None
    }
}

struct Models {
    gps: [GaussianProcess; 3],
    utilities: [Vec<f64>; 3],
}

/// Min-max normalize to [0, 1]; `invert` flips it so lower raw values score
/// higher. A zero-width range maps everything to 0.5.
fn utility(values: &[f64], invert: bool) -> Vec<f64> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    values
        .iter()
        .map(|&v| {
            let t = if hi - lo > 0.0 { (v - lo) / (hi - lo) } else { 0.5 };
            if invert {
                1.0 - t
            } else {
                t
            }
        })
        .collect()
}

fn nearest_distance(x: &[f64], points: &[Vec<f64>]) -> f64 {
    points
        .iter()
        .map(|p| {
            p.iter()
                .zip(x)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .fold(f64::INFINITY, f64::min)
}
