use std::sync::Arc;

use ar_types::{Configuration, EvaluationError, ObjectiveVector};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::evaluator::{EvalSet, TrialEvaluator};

/// Evaluation results keyed by exact configuration.
///
/// Clones share the same entries and statistics, so one cache can outlive a
/// run and serve later runs or a resume over the same evaluation set. Only
/// successful evaluations are stored. Entries never expire on their own;
/// they are dropped through [`invalidate`](Self::invalidate) or
/// [`clear`](Self::clear).
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: Arc<DashMap<String, ObjectiveVector>>,
    stats: Arc<RwLock<CacheStats>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, config: &Configuration) -> Option<ObjectiveVector> {
        let hit = self.entries.get(&config.key()).map(|entry| *entry.value());
        let mut stats = self.stats.write();
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    fn store(&self, config: &Configuration, objectives: ObjectiveVector) {
        self.entries.insert(config.key(), objectives);
    }

    /// Drop the cached result for `config`. Returns whether one existed.
    pub fn invalidate(&self, config: &Configuration) -> bool {
        let removed = self.entries.remove(&config.key()).is_some();
        if removed {
            self.stats.write().invalidations += 1;
        }
        removed
    }

    pub fn clear(&self) {
        let count = self.entries.len() as u64;
        self.entries.clear();
        self.stats.write().invalidations += count;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read()
    }
}

/// A [`TrialEvaluator`] that answers from a [`ResultCache`] before calling
/// the wrapped evaluator.
pub struct CachedEvaluator<E> {
    inner: E,
    cache: ResultCache,
}

impl<E: TrialEvaluator> CachedEvaluator<E> {
    /// Wrap `inner` with a fresh cache.
    pub fn new(inner: E) -> Self {
        Self::with_cache(inner, ResultCache::new())
    }

    pub fn with_cache(inner: E, cache: ResultCache) -> Self {
        Self { inner, cache }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }
}

#[async_trait]
impl<E: TrialEvaluator> TrialEvaluator for CachedEvaluator<E> {
    async fn evaluate(
        &self,
        config: &Configuration,
        eval_set: &EvalSet,
    ) -> Result<ObjectiveVector, EvaluationError> {
        if let Some(hit) = self.cache.lookup(config) {
            debug!(config = %config, "evaluation cache hit");
            return Ok(hit);
        }

        let objectives = self.inner.evaluate(config, eval_set).await?;
        self.cache.store(config, objectives);
        Ok(objectives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEvaluator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TrialEvaluator for CountingEvaluator {
        async fn evaluate(
            &self,
            config: &Configuration,
            _eval_set: &EvalSet,
        ) -> Result<ObjectiveVector, EvaluationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if config.get("fail").is_some() {
                return Err(EvaluationError::UpstreamFailure {
                    message: "503".to_string(),
                });
            }
            // Each call returns a slightly different (noisy) accuracy.
            ObjectiveVector::new(0.5 + call as f64 * 0.01, dec!(0.01), 1.0)
        }
    }

    fn eval_set() -> EvalSet {
        EvalSet::from_pairs([("q", "a")]).unwrap()
    }

    #[tokio::test]
    async fn repeated_configuration_hits_cache() {
        let cached = CachedEvaluator::new(CountingEvaluator::default());
        let config = Configuration::from_values([("top_k", 3_i64)]);

        let first = cached.evaluate(&config, &eval_set()).await.unwrap();
        let second = cached.evaluate(&config, &eval_set()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cached.cache().stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                invalidations: 0
            }
        );
    }

    #[tokio::test]
    async fn invalidation_forces_reevaluation() {
        let cached = CachedEvaluator::new(CountingEvaluator::default());
        let config = Configuration::from_values([("top_k", 3_i64)]);

        let first = cached.evaluate(&config, &eval_set()).await.unwrap();
        assert!(cached.cache().invalidate(&config));
        assert!(!cached.cache().invalidate(&config));
        let second = cached.evaluate(&config, &eval_set()).await.unwrap();
        assert_ne!(first.accuracy, second.accuracy);

        cached.cache().clear();
        assert!(cached.cache().is_empty());
        assert_eq!(cached.cache().stats().invalidations, 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cached = CachedEvaluator::new(CountingEvaluator::default());
        let config = Configuration::from_values([("fail", 1_i64)]);
        assert!(cached.evaluate(&config, &eval_set()).await.is_err());
        assert!(cached.evaluate(&config, &eval_set()).await.is_err());
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 2);
        assert!(cached.cache().is_empty());
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache = ResultCache::new();
        let first = CachedEvaluator::with_cache(CountingEvaluator::default(), cache.clone());
        let second = CachedEvaluator::with_cache(CountingEvaluator::default(), cache.clone());
        let config = Configuration::from_values([("top_k", 4_i64)]);

        let a = first.evaluate(&config, &eval_set()).await.unwrap();
        let b = second.evaluate(&config, &eval_set()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(second.inner().calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert!((cache.stats().hit_rate() - 0.5).abs() < 1e-12);
    }
}
