//! Feature schema and min-max normalization.
//!
//! Tracks arrive with a raw acoustic feature vector produced by an external
//! analysis step. Before they can be indexed, every dimension is scaled into
//! `[0, 1]` using the extremes observed across the whole catalog:
//!
//! ```text
//! normalized[i] = (raw[i] - min[i]) / (max[i] - min[i])   if max[i] != min[i]
//!               = 0.0                                     otherwise
//! ```
//!
//! A dimension that is constant across the catalog is inert: it normalizes to
//! `0.0` for every track and never contributes to a distance.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Identifier of a track in the catalog.
pub type TrackId = u32;

/// High-level descriptors produced by the music analysis step, in index order.
const DEFAULT_FEATURES: &[&str] = &[
    "danceability",
    "female",
    "male",
    "genre_alternative",
    "genre_blues",
    "genre_electronic",
    "genre_folkcountry",
    "genre_funksoulrnb",
    "genre_jazz",
    "genre_pop",
    "genre_raphiphop",
    "genre_rock",
    "mood_acoustic",
    "mood_electronic",
    "mood_happy",
    "mood_party",
    "mood_relaxed",
    "mood_sad",
    "timbre",
    "tonal_atonal",
    "voice_instrumental",
    "average_loudness",
    "dynamic_complexity",
    "bpm",
];

/// Ordered, duplicate-free list of feature names.
///
/// The position of a name is its dimension in every feature and weight vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    /// Build a schema from feature names.
    ///
    /// # Errors
    ///
    /// Fails if `names` is empty or contains a duplicate.
    pub fn new(names: Vec<String>) -> Result<Self> {
        ensure!(!names.is_empty(), "Feature schema needs at least one feature");

        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                bail!("Duplicate feature `{name}` in feature schema");
            }
        }

        Ok(Self { names })
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of dimensions.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self {
            names: DEFAULT_FEATURES.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl TryFrom<Vec<String>> for FeatureSchema {
    type Error = anyhow::Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::new(names)
    }
}

impl From<FeatureSchema> for Vec<String> {
    fn from(schema: FeatureSchema) -> Self {
        schema.names
    }
}

/// A feature vector after min-max scaling.
///
/// Produced by [`normalize`] and cached by the feature store; values may fall
/// outside `[0, 1]` for vectors that were not part of the catalog the range
/// was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedFeatures(Vec<f64>);

impl NormalizedFeatures {
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rehydrates a vector that was normalized earlier and cached.
impl From<Vec<f64>> for NormalizedFeatures {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Per-dimension extremes of the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRange {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl FeatureRange {
    /// Single pass over the catalog collecting the minimum and maximum of
    /// every dimension.
    ///
    /// Returns `Ok(None)` for an empty catalog.
    ///
    /// # Errors
    ///
    /// Fails if the vectors do not all share the same dimensionality.
    pub fn from_catalog<'a, I>(vectors: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut range: Option<Self> = None;

        for vector in vectors {
            match range.as_mut() {
                None => {
                    range = Some(Self {
                        min: vector.to_vec(),
                        max: vector.to_vec(),
                    });
                }
                Some(range) => {
                    ensure!(
                        vector.len() == range.min.len(),
                        "Feature vector has {} dimensions, expected {}",
                        vector.len(),
                        range.min.len()
                    );
                    for (i, &value) in vector.iter().enumerate() {
                        range.min[i] = range.min[i].min(value);
                        range.max[i] = range.max[i].max(value);
                    }
                }
            }
        }

        Ok(range)
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    /// Normalize `raw` against this range.
    ///
    /// # Errors
    ///
    /// Fails on a dimension mismatch.
    pub fn normalize(&self, raw: &[f64]) -> Result<NormalizedFeatures> {
        normalize(raw, &self.min, &self.max)
    }
}

/// Min-max scale `features` into `[0, 1]` using the catalog extremes.
///
/// Degenerate dimensions (`max == min`) yield `0.0` regardless of the raw
/// value. Results are not clamped.
///
/// # Errors
///
/// Fails if `features`, `min` and `max` differ in length.
///
/// # Examples
///
/// ```
/// use echoes::features::normalize;
///
/// let normalized = normalize(&[5.0, 7.0], &[0.0, 7.0], &[10.0, 7.0])?;
/// assert_eq!(normalized.as_slice(), &[0.5, 0.0]);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[allow(clippy::float_cmp)]
pub fn normalize(features: &[f64], min: &[f64], max: &[f64]) -> Result<NormalizedFeatures> {
    ensure!(
        features.len() == min.len() && min.len() == max.len(),
        "Dimension mismatch: features {}, min {}, max {}",
        features.len(),
        min.len(),
        max.len()
    );

    let values = features
        .iter()
        .zip(min.iter().zip(max))
        .map(|(&f, (&lo, &hi))| if hi == lo { 0.0 } else { (f - lo) / (hi - lo) })
        .collect();

    Ok(NormalizedFeatures(values))
}

/// Plain Euclidean distance. Mismatched lengths compare the common prefix.
#[inline]
#[must_use]
pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// `sqrt(sum((w_i * (a_i - b_i))^2))`
#[inline]
#[must_use]
pub fn weighted_euclidean(weights: &[f64], a: &[f64], b: &[f64]) -> f64 {
    weights
        .iter()
        .zip(a.iter().zip(b))
        .map(|(w, (x, y))| {
            let d = w * (x - y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
