//! Configuration space definitions and the numeric encoding used by the
//! surrogate model.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{ArError, ArResult};
use crate::{configuration_error, space_error};

/// Decimal places kept below the leading digit of a continuous dimension's
/// width.
const WIDTH_DIGITS: i32 = 12;

/// Largest decimal exponent a canonical continuous value may be scaled to
/// before rounding. Keeps scaled values exactly representable.
const SCALED_DIGITS: i32 = 15;

/// A single tunable dimension of the retrieval pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    /// Human-readable dimension name (e.g. "top_k").
    pub name: String,
    /// The domain values are drawn from.
    #[serde(flatten)]
    pub domain: Domain,
}

/// Describes the values a dimension may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Domain {
    /// Finite ordered set of labels.
    Categorical { values: Vec<String> },
    /// Integer range [min, max] inclusive.
    Integer { min: i64, max: i64 },
    /// Continuous range [min, max].
    Continuous { min: f64, max: f64 },
}

impl Dimension {
    pub fn categorical<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            domain: Domain::Categorical {
                values: values.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn integer(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            domain: Domain::Integer { min, max },
        }
    }

    pub fn continuous(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            domain: Domain::Continuous { min, max },
        }
    }

    /// Number of coordinates this dimension occupies in the encoded vector.
    pub fn encoded_width(&self) -> usize {
        match &self.domain {
            Domain::Categorical { values } => values.len(),
            Domain::Integer { .. } | Domain::Continuous { .. } => 1,
        }
    }

    fn check(&self) -> ArResult<()> {
        if self.name.trim().is_empty() {
            return Err(space_error!("dimension name must not be empty"));
        }
        match &self.domain {
            Domain::Categorical { values } => {
                if values.is_empty() {
                    return Err(space_error!("categorical dimension '{}' has no values", self.name));
                }
                let mut seen = HashSet::new();
                for value in values {
                    if !seen.insert(value.as_str()) {
                        return Err(space_error!(
                            "categorical dimension '{}' lists '{}' more than once",
                            self.name,
                            value
                        ));
                    }
                }
            }
            Domain::Integer { min, max } => {
                if min > max {
                    return Err(space_error!(
                        "integer dimension '{}' has min {} greater than max {}",
                        self.name,
                        min,
                        max
                    ));
                }
                if max.checked_sub(*min).is_none() {
                    return Err(space_error!(
                        "integer dimension '{}' spans more than i64::MAX values",
                        self.name
                    ));
                }
            }
            Domain::Continuous { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(space_error!(
                        "continuous dimension '{}' has non-finite bounds",
                        self.name
                    ));
                }
                if min > max {
                    return Err(space_error!(
                        "continuous dimension '{}' has min {} greater than max {}",
                        self.name,
                        min,
                        max
                    ));
                }
                if !(max - min).is_finite() {
                    return Err(space_error!(
                        "continuous dimension '{}' has a width that overflows f64",
                        self.name
                    ));
                }
            }
        }
        Ok(())
    }

    fn contains(&self, value: &ParamValue) -> ArResult<()> {
        match (&self.domain, value) {
            (Domain::Categorical { values }, ParamValue::Categorical(v)) => {
                if values.iter().any(|allowed| allowed == v) {
                    Ok(())
                } else {
                    Err(configuration_error!(
                        "'{}' is not a value of dimension '{}'",
                        v,
                        self.name
                    ))
                }
            }
            (Domain::Integer { min, max }, ParamValue::Int(v)) => {
                if v < min || v > max {
                    Err(configuration_error!(
                        "{} is outside [{}, {}] for dimension '{}'",
                        v,
                        min,
                        max,
                        self.name
                    ))
                } else {
                    Ok(())
                }
            }
            (Domain::Continuous { min, max }, ParamValue::Float(v)) => {
                if !v.is_finite() || *v < *min || *v > *max {
                    Err(configuration_error!(
                        "{} is outside [{}, {}] for dimension '{}'",
                        v,
                        min,
                        max,
                        self.name
                    ))
                } else {
                    Ok(())
                }
            }
            (_, other) => Err(configuration_error!(
                "value {} has the wrong kind for dimension '{}'",
                other,
                self.name
            )),
        }
    }
}

/// A concrete value for one dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Categorical(String),
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => float_bits(*a) == float_bits(*b),
            (Self::Categorical(a), Self::Categorical(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Categorical(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Categorical(v.to_string())
    }
}

/// One concrete assignment of values to every dimension of a [`ConfigSpace`].
///
/// Only [`ConfigSpace::configuration`], [`ConfigSpace::sample_random`] and
/// [`ConfigSpace::decode`] produce validated configurations; a configuration
/// built with [`Configuration::from_values`] must be checked with
/// [`ConfigSpace::validate`] before use.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, ParamValue>,
}

impl Configuration {
    /// Build an unvalidated configuration.
    pub fn from_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical string key. Two configurations share a key exactly when they
    /// compare equal.
    pub fn key(&self) -> String {
        let mut key = String::new();
        for (name, value) in &self.values {
            let rendered = match value {
                ParamValue::Float(v) => format!("{:?}", f64::from_bits(float_bits(*v))),
                other => other.to_string(),
            };
            key.push_str(name);
            key.push('=');
            key.push_str(&rendered);
            key.push(';');
        }
        key
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// The full configuration space: a validated, ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Dimension>", into = "Vec<Dimension>")]
pub struct ConfigSpace {
    dimensions: Vec<Dimension>,
}

impl TryFrom<Vec<Dimension>> for ConfigSpace {
    type Error = ArError;

    fn try_from(dimensions: Vec<Dimension>) -> ArResult<Self> {
        Self::new(dimensions)
    }
}

impl From<ConfigSpace> for Vec<Dimension> {
    fn from(space: ConfigSpace) -> Self {
        space.dimensions
    }
}

impl ConfigSpace {
    /// Validate a declarative dimension list.
    pub fn new(dimensions: Vec<Dimension>) -> ArResult<Self> {
        if dimensions.is_empty() {
            return Err(space_error!("config space declares no dimensions"));
        }
        let mut names = HashSet::new();
        for dim in &dimensions {
            dim.check()?;
            if !names.insert(dim.name.as_str()) {
                return Err(space_error!("dimension '{}' is declared more than once", dim.name));
            }
        }
        Ok(Self { dimensions })
    }

    /// The knobs exposed by the standard retrieval pipeline.
    pub fn retrieval_preset() -> Self {
        Self {
            dimensions: vec![
                Dimension::integer("top_k", 1, 10),
                Dimension::continuous("temperature", 0.0, 1.0),
                Dimension::categorical(
                    "llm_model",
                    [
                        "llama-3.3-70b-versatile",
                        "llama-3.1-8b-instant",
                        "mixtral-8x7b-32768",
                    ],
                ),
                Dimension::categorical("embedding_model", ["all-MiniLM-L6-v2", "all-mpnet-base-v2"]),
                Dimension::integer("max_tokens", 128, 1024),
            ],
        }
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Length of every vector produced by [`encode`](Self::encode).
    pub fn encoded_len(&self) -> usize {
        self.dimensions.iter().map(Dimension::encoded_width).sum()
    }

    /// Total number of distinct configurations (returns `None` if any
    /// dimension is continuous or the count overflows).
    pub fn grid_size(&self) -> Option<u64> {
        let mut total: u64 = 1;
        for dim in &self.dimensions {
            let size = match &dim.domain {
                Domain::Categorical { values } => values.len() as u64,
                Domain::Integer { min, max } => (max - min) as u64 + 1,
                Domain::Continuous { .. } => return None,
            };
            total = total.checked_mul(size)?;
        }
        Some(total)
    }

    /// Build a validated configuration. Integer values given for continuous
    /// dimensions are widened to floats, and continuous values are snapped to
    /// the dimension's canonical grid.
    pub fn configuration<I, K, V>(&self, values: I) -> ArResult<Configuration>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        let mut config = Configuration::from_values(values);
        for dim in &self.dimensions {
            if !matches!(dim.domain, Domain::Continuous { .. }) {
                continue;
            }
            if let Some(value) = config.values.get_mut(&dim.name) {
                if let ParamValue::Int(v) = *value {
                    *value = ParamValue::Float(v as f64);
                }
            }
        }
        self.validate(&config)?;
        for dim in &self.dimensions {
            if let (Domain::Continuous { min, max }, Some(ParamValue::Float(v))) =
                (&dim.domain, config.values.get_mut(&dim.name))
            {
                *v = snap(*v, *min, *max);
            }
        }
        Ok(config)
    }

    /// Check that `config` assigns an in-domain value to every dimension and
    /// nothing else.
    pub fn validate(&self, config: &Configuration) -> ArResult<()> {
        for dim in &self.dimensions {
            let value = config
                .get(&dim.name)
                .ok_or_else(|| configuration_error!("missing value for dimension '{}'", dim.name))?;
            dim.contains(value)?;
        }
        if config.len() != self.dimensions.len() {
            let unknown: Vec<&str> = config
                .values
                .keys()
                .filter(|name| !self.dimensions.iter().any(|d| &d.name == *name))
                .map(String::as_str)
                .collect();
            return Err(configuration_error!("unknown dimensions: {}", unknown.join(", ")));
        }
        Ok(())
    }

    /// Draw a configuration uniformly at random.
    pub fn sample_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let mut values = BTreeMap::new();
        for dim in &self.dimensions {
            let value = match &dim.domain {
                Domain::Categorical { values } => {
                    ParamValue::Categorical(values[rng.random_range(0..values.len())].clone())
                }
                Domain::Integer { min, max } => ParamValue::Int(rng.random_range(*min..=*max)),
                Domain::Continuous { min, max } => {
                    if min == max {
                        ParamValue::Float(*min)
                    } else {
                        ParamValue::Float(snap(rng.random_range(*min..=*max), *min, *max))
                    }
                }
            };
            values.insert(dim.name.clone(), value);
        }
        Configuration { values }
    }

    /// Map a configuration onto a fixed-length vector in `[0, 1]`: one-hot
    /// blocks for categorical dimensions, min-max normalization otherwise.
    pub fn encode(&self, config: &Configuration) -> ArResult<Vec<f64>> {
        self.validate(config)?;
        let mut encoded = Vec::with_capacity(self.encoded_len());
        for dim in &self.dimensions {
            match (&dim.domain, config.get(&dim.name)) {
                (Domain::Categorical { values }, Some(ParamValue::Categorical(v))) => {
                    encoded.extend(values.iter().map(|c| if c == v { 1.0 } else { 0.0 }));
                }
                (Domain::Integer { min, max }, Some(ParamValue::Int(v))) => {
                    encoded.push(normalize(*v as f64, *min as f64, *max as f64));
                }
                (Domain::Continuous { min, max }, Some(ParamValue::Float(v))) => {
                    encoded.push(normalize(*v, *min, *max));
                }
                _ => unreachable!("validated above"),
            }
        }
        Ok(encoded)
    }

    /// Inverse of [`encode`](Self::encode). Coordinates are clamped into
    /// `[0, 1]`, one-hot blocks snap to their largest coordinate and integer
    /// dimensions round to the nearest value.
    pub fn decode(&self, encoded: &[f64]) -> ArResult<Configuration> {
        if encoded.len() != self.encoded_len() {
            return Err(configuration_error!(
                "encoded vector has {} coordinates, expected {}",
                encoded.len(),
                self.encoded_len()
            ));
        }

        let mut values = BTreeMap::new();
        let mut offset = 0;
        for dim in &self.dimensions {
            let width = dim.encoded_width();
            let block = &encoded[offset..offset + width];
            offset += width;

            let value = match &dim.domain {
                Domain::Categorical { values } => {
                    let mut best = 0;
                    let mut best_score = f64::NEG_INFINITY;
                    for (i, &x) in block.iter().enumerate() {
                        if x.is_finite() && x > best_score {
                            best = i;
                            best_score = x;
                        }
                    }
                    ParamValue::Categorical(values[best].clone())
                }
                Domain::Integer { min, max } => {
                    let t = unit(block[0]);
                    let raw = (*min as f64 + t * (*max - *min) as f64).round() as i64;
                    ParamValue::Int(raw.clamp(*min, *max))
                }
                Domain::Continuous { min, max } => {
                    let t = unit(block[0]);
                    ParamValue::Float(snap(min + t * (max - min), *min, *max))
                }
            };
            values.insert(dim.name.clone(), value);
        }
        Ok(Configuration { values })
    }
}

/// Bit pattern used for float equality: `-0.0` folds into `0.0` and every NaN
/// into one NaN.
fn float_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0_f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

/// Round a continuous value onto a decimal grid sized to the dimension.
///
/// The grid keeps `WIDTH_DIGITS` decimal places below the leading digit of
/// `max - min`, capped so the scaled value stays below `10^SCALED_DIGITS`.
/// Snapping is idempotent and survives an encode/decode trip, so snapped
/// values compare equal bit for bit.
fn snap(value: f64, min: f64, max: f64) -> f64 {
    let width = max - min;
    if width <= 0.0 || !value.is_finite() {
        return value.clamp(min, max);
    }
    let magnitude = min.abs().max(max.abs());
    let places = (WIDTH_DIGITS - width.log10().floor() as i32)
        .min(SCALED_DIGITS - magnitude.log10().ceil() as i32)
        .clamp(-300, 300);
    let snapped = if places >= 0 {
        let scale = 10_f64.powi(places);
        (value * scale).round() / scale
    } else {
        let scale = 10_f64.powi(-places);
        (value / scale).round() * scale
    };
    snapped.clamp(min, max)
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max - min == 0.0 {
        0.5
    } else {
        (value - min) / (max - min)
    }
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.5
    }
}
