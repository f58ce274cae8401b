//! Run settings loaded from TOML.
//!
//! ```toml
//! [run]
//! name = "faq-bot"
//! budget = 24
//! concurrency = 4
//!
//! [evaluation]
//! timeout_secs = 120.0
//! max_retries = 2
//!
//! [[space]]
//! name = "top_k"
//! kind = "integer"
//! min = 1
//! max = 10
//! ```
//!
//! Every section is optional. Without a `[[space]]` list the retrieval preset
//! space is used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ar_optimizer::SurrogateSettings;
use ar_types::{settings_error, ArResult, ConfigSpace, Dimension};
use serde::{Deserialize, Serialize};

pub const MIN_BUDGET: usize = 1;
pub const MAX_BUDGET: usize = 100;
pub const MIN_TEST_QUESTIONS: usize = 10;
pub const MAX_TEST_QUESTIONS: usize = 500;
/// One day.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub run: RunSettings,
    pub evaluation: EvaluationSettings,
    pub surrogate: SurrogateSettings,
    pub storage: StorageSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<Vec<Dimension>>,
}

/// Budget and scheduling limits for one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub name: String,
    /// Maximum number of budget-counted trials.
    pub budget: usize,
    /// Ceiling on simultaneously running trials.
    pub concurrency: usize,
    /// Configurations requested from the optimizer per round.
    pub batch_size: usize,
    /// The run fails once failed trials exceed this fraction of the budget.
    pub max_failure_ratio: f64,
    /// Expected evaluation-set size. Only used to warn on mismatch.
    pub test_questions: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            name: "autorag".to_string(),
            budget: 20,
            concurrency: 4,
            batch_size: 4,
            max_failure_ratio: 0.5,
            test_questions: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Hard wall-clock limit per evaluation attempt.
    pub timeout_secs: f64,
    /// Retries after the first attempt, transient errors only.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300.0,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl EvaluationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding one journal file per run.
    pub run_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
        }
    }
}

pub fn default_run_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("autorag").join("runs"))
        .unwrap_or_else(|| PathBuf::from("runs"))
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> ArResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(settings_error!(
                "settings file not found: {}. Create one (every section is optional) or run with defaults",
                path.display()
            ));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ArResult<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| settings_error!("failed to parse settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ArResult<()> {
        let run = &self.run;
        if !(MIN_BUDGET..=MAX_BUDGET).contains(&run.budget) {
            return Err(settings_error!(
                "run.budget must be between {} and {}, got {}",
                MIN_BUDGET,
                MAX_BUDGET,
                run.budget
            ));
        }
        if run.concurrency == 0 {
            return Err(settings_error!("run.concurrency must be > 0"));
        }
        if run.batch_size == 0 {
            return Err(settings_error!("run.batch_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&run.max_failure_ratio) {
            return Err(settings_error!(
                "run.max_failure_ratio must be within [0, 1], got {}",
                run.max_failure_ratio
            ));
        }
        if !(MIN_TEST_QUESTIONS..=MAX_TEST_QUESTIONS).contains(&run.test_questions) {
            return Err(settings_error!(
                "run.test_questions must be between {} and {}, got {}",
                MIN_TEST_QUESTIONS,
                MAX_TEST_QUESTIONS,
                run.test_questions
            ));
        }

        let eval = &self.evaluation;
        if !eval.timeout_secs.is_finite()
            || eval.timeout_secs <= 0.0
            || eval.timeout_secs > MAX_TIMEOUT_SECS
        {
            return Err(settings_error!(
                "evaluation.timeout_secs must be in (0, {}], got {}",
                MAX_TIMEOUT_SECS,
                eval.timeout_secs
            ));
        }
        if eval.max_backoff_ms < eval.retry_backoff_ms {
            return Err(settings_error!(
                "evaluation.max_backoff_ms must be >= evaluation.retry_backoff_ms"
            ));
        }

        let surrogate = &self.surrogate;
        if surrogate.candidates == 0 {
            return Err(settings_error!("surrogate.candidates must be > 0"));
        }
        if !surrogate.noise_variance.is_finite() || surrogate.noise_variance <= 0.0 {
            return Err(settings_error!("surrogate.noise_variance must be > 0"));
        }

        if let Some(dims) = &self.space {
            ConfigSpace::new(dims.clone())?;
        }
        Ok(())
    }

    /// The declared space, or the retrieval preset when none is declared.
    pub fn config_space(&self) -> ArResult<ConfigSpace> {
        match &self.space {
            Some(dims) => ConfigSpace::new(dims.clone()),
            None => Ok(ConfigSpace::retrieval_preset()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.run.name = name.to_string();
        self
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.run.budget = budget;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.run.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.run.batch_size = batch_size;
        self
    }

    pub fn with_max_failure_ratio(mut self, ratio: f64) -> Self {
        self.run.max_failure_ratio = ratio;
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.evaluation.timeout_secs = secs;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.evaluation.max_retries = max_retries;
        self.evaluation.retry_backoff_ms = backoff_ms;
        self.evaluation.max_backoff_ms = self.evaluation.max_backoff_ms.max(backoff_ms);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.surrogate.seed = Some(seed);
        self
    }

    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.run_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::ArError;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = Settings::from_str("").unwrap();
        assert_eq!(settings.run.budget, 20);
        assert_eq!(settings.run.test_questions, 50);
        assert_eq!(settings.surrogate.initial_design, 5);
        assert!(settings.space.is_none());
        assert_eq!(settings.config_space().unwrap(), ConfigSpace::retrieval_preset());
    }

    #[test]
    fn parses_sections_and_space() {
        let settings = Settings::from_str(
            r#"
            [run]
            name = "faq"
            budget = 6
            concurrency = 2

            [evaluation]
            timeout_secs = 12.5

            [surrogate]
            seed = 7

            [[space]]
            name = "retriever"
            kind = "categorical"
            values = ["A", "B", "C"]

            [[space]]
            name = "top_k"
            kind = "integer"
            min = 1
            max = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.run.name, "faq");
        assert_eq!(settings.run.budget, 6);
        assert_eq!(settings.run.batch_size, 4);
        assert_eq!(settings.evaluation.timeout(), Duration::from_millis(12_500));
        assert_eq!(settings.surrogate.seed, Some(7));
        let space = settings.config_space().unwrap();
        assert_eq!(space.dimensions().len(), 2);
        assert_eq!(space.grid_size(), Some(15));
    }

    #[test]
    fn budget_outside_limits_is_rejected() {
        for budget in [0, 101] {
            let err = Settings::default().with_budget(budget).validate().unwrap_err();
            assert!(matches!(err, ArError::Settings(_)), "{err}");
        }
        assert!(Settings::default().with_budget(100).validate().is_ok());
    }

    #[test]
    fn malformed_space_is_rejected() {
        let err = Settings::from_str(
            r#"
            [[space]]
            name = "top_k"
            kind = "integer"
            min = 5
            max = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ArError::InvalidConfigSpace(_)), "{err}");
    }

    #[test]
    fn invalid_ratio_and_timeout_are_rejected() {
        assert!(Settings::default().with_max_failure_ratio(1.5).validate().is_err());
        assert!(Settings::default().with_timeout_secs(0.0).validate().is_err());
        assert!(Settings::default().with_timeout_secs(1e20).validate().is_err());
        assert!(Settings::default()
            .with_timeout_secs(MAX_TIMEOUT_SECS)
            .validate()
            .is_ok());

        let err = Settings::from_str("[evaluation]\ntimeout_secs = 1e20\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"), "{err}");
        assert!(Settings::default().with_concurrency(0).validate().is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Settings::from_file("/definitely/not/here/autorag.toml").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/definitely/not/here/autorag.toml"));
        assert!(message.contains("not found"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let eval = EvaluationSettings {
            retry_backoff_ms: 100,
            max_backoff_ms: 350,
            ..EvaluationSettings::default()
        };
        assert_eq!(eval.backoff(1), Duration::from_millis(100));
        assert_eq!(eval.backoff(2), Duration::from_millis(200));
        assert_eq!(eval.backoff(3), Duration::from_millis(350));
        assert_eq!(eval.backoff(40), Duration::from_millis(350));
    }
}
