//! Per-feature weights and their persistence.
//!
//! A [`WeightVector`] holds one multiplier per feature dimension. Every
//! component is kept inside `[MIN_WEIGHT, MAX_WEIGHT]`: values are clamped on
//! construction and after every gradient step, so an out-of-range weight can
//! never be observed.
//!
//! On disk the weights live in the `features` section of the configuration
//! file as an ordered map `featureName -> { "weight": f64 }`. The map is read
//! and written wholesale; a file that misses a known feature or names an
//! unknown one is rejected at load time.

use crate::config::AppConfig;
use crate::features::FeatureSchema;
use anyhow::{ensure, Context, Result};
use log::{debug, warn};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

pub const MIN_WEIGHT: f64 = 0.0;
pub const MAX_WEIGHT: f64 = 2.0;

/// NaN collapses to the lower bound.
#[inline]
fn clamp_weight(weight: f64) -> f64 {
    if weight.is_nan() {
        MIN_WEIGHT
    } else {
        weight.clamp(MIN_WEIGHT, MAX_WEIGHT)
    }
}

/// One weight per feature dimension, always within `[0.0, 2.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightVector(Vec<f64>);

impl WeightVector {
    /// Build a weight vector, clamping every component into range.
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self(values.into_iter().map(clamp_weight).collect())
    }

    #[must_use]
    pub fn uniform(dimension: usize, weight: f64) -> Self {
        Self::new(vec![weight; dimension])
    }

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

    /// Elementwise product `weights[i] * features[i]`.
    #[must_use]
    pub fn apply(&self, features: &[f64]) -> Vec<f64> {
        self.0.iter().zip(features).map(|(w, f)| w * f).collect()
    }

    /// `weights -= learning_rate * gradient`, then clamp.
    pub fn descend(&mut self, gradient: &[f64], learning_rate: f64) {
        for (w, g) in self.0.iter_mut().zip(gradient) {
            *w = clamp_weight(*w - learning_rate * g);
        }
    }
}

/// Settings stored per feature in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSetting {
    pub weight: f64,
}

/// Ordered `featureName -> { weight }` table.
///
/// Serializes as a JSON object whose key order is the feature order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    entries: Vec<(String, FeatureSetting)>,
}

impl FeatureTable {
    /// Pair every schema feature with its weight.
    ///
    /// # Errors
    ///
    /// Fails if the weight vector does not match the schema dimension.
    pub fn from_weights(schema: &FeatureSchema, weights: &WeightVector) -> Result<Self> {
        ensure!(
            schema.dimension() == weights.len(),
            "Weight vector has {} entries but the schema has {} features",
            weights.len(),
            schema.dimension()
        );

        let entries = schema
            .names()
            .iter()
            .zip(weights.as_slice())
            .map(|(name, &weight)| (name.clone(), FeatureSetting { weight }))
            .collect();

        Ok(Self { entries })
    }

    /// The schema implied by the table's key order.
    ///
    /// # Errors
    ///
    /// Fails if the table is empty.
    pub fn schema(&self) -> Result<FeatureSchema> {
        FeatureSchema::new(self.entries.iter().map(|(name, _)| name.clone()).collect())
    }

    /// Weights in `schema` order.
    ///
    /// Every schema feature must be present, and nothing else may be.
    ///
    /// # Errors
    ///
    /// Fails on a missing or unknown feature name.
    pub fn weights(&self, schema: &FeatureSchema) -> Result<WeightVector> {
        let mut values = vec![0.0; schema.dimension()];
        let mut seen = vec![false; schema.dimension()];

        for (name, setting) in &self.entries {
            let position = schema
                .position(name)
                .with_context(|| format!("Unknown feature `{name}` in weight configuration"))?;
            if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&setting.weight) {
                warn!(
                    "Weight {} for `{name}` outside [{MIN_WEIGHT}, {MAX_WEIGHT}], clamping",
                    setting.weight
                );
            }
            values[position] = setting.weight;
            seen[position] = true;
        }

        if let Some(missing) = seen.iter().position(|s| !s) {
            anyhow::bail!(
                "Weight configuration is missing feature `{}`",
                schema.names()[missing]
            );
        }

        Ok(WeightVector::new(values))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(name, s)| (name.as_str(), s.weight))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FeatureTable {
    fn default() -> Self {
        let schema = FeatureSchema::default();
        let entries = schema
            .names()
            .iter()
            .map(|name| (name.clone(), FeatureSetting { weight: 1.0 }))
            .collect();
        Self { entries }
    }
}

impl Serialize for FeatureTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, setting) in &self.entries {
            map.serialize_entry(name, setting)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FeatureTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = FeatureTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of feature name to { \"weight\": number }")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FeatureTable, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                let mut seen = HashSet::new();
                while let Some((name, setting)) = access.next_entry::<String, FeatureSetting>()? {
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!("duplicate feature `{name}`")));
                    }
                    entries.push((name, setting));
                }
                Ok(FeatureTable { entries })
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

/// Owner of the current weight vector.
///
/// `save` replaces the stored vector wholesale.
pub trait WeightStore {
    fn schema(&self) -> &FeatureSchema;

    /// # Errors
    ///
    /// Fails if the backing artifact is unreadable or does not match the schema.
    fn load(&self) -> Result<WeightVector>;

    /// # Errors
    ///
    /// Fails if the vector does not match the schema or cannot be written.
    fn save(&self, weights: &WeightVector) -> Result<()>;
}

/// Weight store backed by the `features` section of the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigWeightStore {
    path: PathBuf,
    schema: FeatureSchema,
}

impl ConfigWeightStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, schema: FeatureSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WeightStore for ConfigWeightStore {
    fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    fn load(&self) -> Result<WeightVector> {
        let config = AppConfig::load(&self.path)?;
        config
            .features
            .weights(&self.schema)
            .with_context(|| format!("Invalid weights in {}", self.path.display()))
    }

    fn save(&self, weights: &WeightVector) -> Result<()> {
        let mut config = AppConfig::load(&self.path)?;
        config.features = FeatureTable::from_weights(&self.schema, weights)?;
        config.save(&self.path)?;
        debug!("Saved {} feature weights to {}", weights.len(), self.path.display());
        Ok(())
    }
}
