//! Collaborator interfaces consumed by the similarity engine.
//!
//! The engine never talks to a database directly. It asks a [`FeatureStore`]
//! for normalized vectors and a [`TrackCatalog`] for display metadata. A
//! missing track is `Ok(None)`: callers skip it and carry on.
//!
//! [`MemoryStore`] implements both traits for tests, benchmarks and catalogs
//! that fit in memory; [`crate::db::Database`] is the SQLite implementation.

use crate::features::{FeatureRange, NormalizedFeatures, TrackId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Display metadata of a catalogued track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub path: String,
}

pub trait FeatureStore {
    /// Every track id that may have features, in ascending order.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    fn track_ids(&self) -> Result<Vec<TrackId>>;

    /// Normalized feature vector of `id`, or `None` if the track has none.
    ///
    /// # Errors
    ///
    /// Backend failures only; a missing track is not an error.
    fn normalized_features(&self, id: TrackId) -> Result<Option<NormalizedFeatures>>;
}

pub trait TrackCatalog {
    /// # Errors
    ///
    /// Backend failures only; a missing track is not an error.
    fn track(&self, id: TrackId) -> Result<Option<TrackInfo>>;
}

/// In-memory feature store and catalog.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    features: BTreeMap<TrackId, NormalizedFeatures>,
    tracks: BTreeMap<TrackId, TrackInfo>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a raw catalog and keep the result.
    ///
    /// # Errors
    ///
    /// Fails if the raw vectors disagree on dimensionality.
    pub fn from_raw(raw: &BTreeMap<TrackId, Vec<f64>>) -> Result<Self> {
        let mut store = Self::new();
        if let Some(range) = FeatureRange::from_catalog(raw.values().map(Vec::as_slice))? {
            for (&id, vector) in raw {
                store.features.insert(id, range.normalize(vector)?);
            }
        }
        Ok(store)
    }

    pub fn insert_features(&mut self, id: TrackId, features: impl Into<NormalizedFeatures>) {
        self.features.insert(id, features.into());
    }

    pub fn insert_track(&mut self, track: TrackInfo) {
        self.tracks.insert(track.id, track);
    }

    #[must_use]
    pub fn features(&self) -> &BTreeMap<TrackId, NormalizedFeatures> {
        &self.features
    }
}

impl FeatureStore for MemoryStore {
    fn track_ids(&self) -> Result<Vec<TrackId>> {
        Ok(self.features.keys().copied().collect())
    }

    fn normalized_features(&self, id: TrackId) -> Result<Option<NormalizedFeatures>> {
        Ok(self.features.get(&id).cloned())
    }
}

impl TrackCatalog for MemoryStore {
    fn track(&self, id: TrackId) -> Result<Option<TrackInfo>> {
        Ok(self.tracks.get(&id).cloned())
    }
}
