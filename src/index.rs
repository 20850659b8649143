//! Approximate nearest-neighbor index over weighted feature vectors.
//!
//! The index is a forest of random projection trees. Each tree recursively
//! splits the point set with a hyperplane placed between two centroids found
//! by a cheap sampled two-means; leaves hold at most [`MAX_LEAF_ITEMS`]
//! points. A query walks all trees at once through a priority queue keyed on
//! the smallest hyperplane margin seen along the path, gathers candidates
//! until `trees * max(k, MAX_LEAF_ITEMS)` points are collected, and ranks them
//! by exact Euclidean distance.
//!
//! Weights are baked in at build time: every stored point is
//! `weights[i] * features[i]`. Changing the weights therefore requires a
//! rebuild, and a vector passed to [`AnnIndex::query_by_vector`] must already
//! live in the weighted space.
//!
//! The built index is immutable. [`AnnIndex::save`] writes a new artifact next
//! to the old one and renames it into place, so a concurrent
//! [`AnnIndex::load`] sees either the previous or the new index.

use crate::config::write_atomic;
use crate::features::{euclidean, NormalizedFeatures, TrackId};
use crate::store::FeatureStore;
use crate::weights::WeightVector;
use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Largest point set a tree keeps in a single leaf.
pub const MAX_LEAF_ITEMS: usize = 16;

/// Sampling steps used to place the two centroids of a split.
const TWO_MEANS_STEPS: usize = 200;

/// A search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: TrackId,
    pub distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        items: Vec<u32>,
    },
    Split {
        normal: Vec<f64>,
        offset: f64,
        left: u32,
        right: u32,
    },
}

/// Built similarity index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnIndex {
    dimension: usize,
    ids: Vec<TrackId>,
    points: Vec<Vec<f64>>,
    nodes: Vec<Node>,
    roots: Vec<u32>,
    #[serde(skip)]
    slots: HashMap<TrackId, u32>,
}

/// Queue entry for the best-first forest walk.
#[derive(Debug, Clone, Copy)]
struct Pending {
    priority: f64,
    node: u32,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.node.cmp(&self.node))
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Signed distance-like position of `point` relative to a hyperplane.
#[inline]
fn margin(normal: &[f64], offset: f64, point: &[f64]) -> f64 {
    dot(normal, point) + offset
}

/// Two centroids that roughly bisect `items`.
fn two_means<R: Rng>(points: &[Vec<f64>], items: &[u32], rng: &mut R) -> (Vec<f64>, Vec<f64>) {
    let n = items.len();
    let i = rng.gen_range(0..n);
    let mut j = rng.gen_range(0..n - 1);
    if j >= i {
        j += 1;
    }

    let mut p = points[items[i] as usize].clone();
    let mut q = points[items[j] as usize].clone();
    let (mut p_count, mut q_count) = (1.0, 1.0);

    for _ in 0..TWO_MEANS_STEPS {
        let x = &points[items[rng.gen_range(0..n)] as usize];
        let dp = p_count * squared_distance(&p, x);
        let dq = q_count * squared_distance(&q, x);

        if dp < dq {
            for (c, v) in p.iter_mut().zip(x) {
                *c = (*c * p_count + v) / (p_count + 1.0);
            }
            p_count += 1.0;
        } else if dq < dp {
            for (c, v) in q.iter_mut().zip(x) {
                *c = (*c * q_count + v) / (q_count + 1.0);
            }
            q_count += 1.0;
        }
    }

    (p, q)
}

/// Split `items` by the hyperplane halfway between two centroids.
///
/// If the plane fails to separate anything (duplicate points), the items are
/// halved at random and the plane is zeroed so both sides rank equally at
/// query time.
fn split<R: Rng>(
    points: &[Vec<f64>],
    items: &[u32],
    rng: &mut R,
) -> (Vec<f64>, f64, Vec<u32>, Vec<u32>) {
    let (p, q) = two_means(points, items, rng);
    let mut normal: Vec<f64> = p.iter().zip(&q).map(|(a, b)| a - b).collect();
    let midpoint: Vec<f64> = p.iter().zip(&q).map(|(a, b)| (a + b) / 2.0).collect();
    let mut offset = -dot(&normal, &midpoint);

    let (mut left, mut right): (Vec<u32>, Vec<u32>) = items
        .iter()
        .partition(|&&item| margin(&normal, offset, &points[item as usize]) <= 0.0);

    if left.is_empty() || right.is_empty() {
        let mut shuffled = items.to_vec();
        shuffled.shuffle(rng);
        right = shuffled.split_off(shuffled.len() / 2);
        left = shuffled;
        normal.iter_mut().for_each(|c| *c = 0.0);
        offset = 0.0;
    }

    (normal, offset, left, right)
}

/// Grow one tree over `items`, appending its nodes to `nodes`.
fn grow_tree<R: Rng>(points: &[Vec<f64>], nodes: &mut Vec<Node>, items: Vec<u32>, rng: &mut R) -> u32 {
    let root = nodes.len() as u32;
    nodes.push(Node::Leaf { items: Vec::new() });

    let mut pending = vec![(root, items)];
    while let Some((at, items)) = pending.pop() {
        if items.len() <= MAX_LEAF_ITEMS {
            nodes[at as usize] = Node::Leaf { items };
            continue;
        }

        let (normal, offset, left_items, right_items) = split(points, &items, rng);
        let left = nodes.len() as u32;
        nodes.push(Node::Leaf { items: Vec::new() });
        let right = nodes.len() as u32;
        nodes.push(Node::Leaf { items: Vec::new() });

        nodes[at as usize] = Node::Split {
            normal,
            offset,
            left,
            right,
        };
        pending.push((left, left_items));
        pending.push((right, right_items));
    }

    root
}

impl AnnIndex {
    /// Build an index over `items`, weighting every vector with `weights`.
    ///
    /// Vectors whose length differs from `weights` are skipped with a warning,
    /// as are repeated ids. Zero items give an empty index whose queries
    /// always return nothing.
    ///
    /// # Errors
    ///
    /// Fails if `trees` is zero or `weights` is empty.
    pub fn build<I>(items: I, weights: &WeightVector, trees: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (TrackId, NormalizedFeatures)>,
    {
        Self::build_with_rng(items, weights, trees, &mut StdRng::from_entropy())
    }

    /// Same as [`AnnIndex::build`] with a deterministic tree layout.
    ///
    /// # Errors
    ///
    /// See [`AnnIndex::build`].
    pub fn build_seeded<I>(items: I, weights: &WeightVector, trees: usize, seed: u64) -> Result<Self>
    where
        I: IntoIterator<Item = (TrackId, NormalizedFeatures)>,
    {
        Self::build_with_rng(items, weights, trees, &mut StdRng::seed_from_u64(seed))
    }

    fn build_with_rng<I, R>(items: I, weights: &WeightVector, trees: usize, rng: &mut R) -> Result<Self>
    where
        I: IntoIterator<Item = (TrackId, NormalizedFeatures)>,
        R: Rng,
    {
        ensure!(trees > 0, "An index needs at least one tree");
        ensure!(!weights.is_empty(), "Cannot index zero-dimensional vectors");

        let dimension = weights.len();
        let mut index = Self {
            dimension,
            ids: Vec::new(),
            points: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
            slots: HashMap::new(),
        };

        for (id, features) in items {
            if features.len() != dimension {
                warn!(
                    "Track {id} has {} features, expected {dimension}; not indexed",
                    features.len()
                );
                continue;
            }
            if index.slots.contains_key(&id) {
                warn!("Track {id} given twice; keeping the first vector");
                continue;
            }
            index.slots.insert(id, index.ids.len() as u32);
            index.ids.push(id);
            index.points.push(weights.apply(features.as_slice()));
        }

        if index.ids.is_empty() {
            info!("Built empty feature index");
            return Ok(index);
        }

        let all: Vec<u32> = (0..index.ids.len() as u32).collect();
        for _ in 0..trees {
            let root = grow_tree(&index.points, &mut index.nodes, all.clone(), rng);
            index.roots.push(root);
        }

        info!(
            "Built feature index: {} tracks, {} trees, {} nodes",
            index.ids.len(),
            trees,
            index.nodes.len()
        );
        Ok(index)
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: TrackId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Indexed track ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> &[TrackId] {
        &self.ids
    }

    /// Weighted point stored for `id`.
    #[must_use]
    pub fn point(&self, id: TrackId) -> Option<&[f64]> {
        self.slots
            .get(&id)
            .map(|&slot| self.points[slot as usize].as_slice())
    }

    /// Euclidean distance between two indexed tracks.
    #[must_use]
    pub fn distance(&self, a: TrackId, b: TrackId) -> Option<f64> {
        Some(euclidean(self.point(a)?, self.point(b)?))
    }

    /// Up to `k` nearest indexed tracks to `vector`, by ascending distance.
    ///
    /// `vector` must already be weighted.
    ///
    /// # Errors
    ///
    /// Fails if `vector` does not have the index dimension.
    pub fn query_by_vector(&self, vector: &[f64], k: usize) -> Result<Vec<Neighbor>> {
        ensure!(
            vector.len() == self.dimension,
            "Query has {} dimensions, index has {}",
            vector.len(),
            self.dimension
        );
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let search_k = self.roots.len() * k.max(MAX_LEAF_ITEMS);
        let mut queue: BinaryHeap<Pending> = self
            .roots
            .iter()
            .map(|&node| Pending {
                priority: f64::INFINITY,
                node,
            })
            .collect();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        while candidates.len() < search_k {
            let Some(top) = queue.pop() else { break };
            match &self.nodes[top.node as usize] {
                Node::Leaf { items } => {
                    candidates.extend(items.iter().copied().filter(|&slot| seen.insert(slot)));
                }
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    let m = margin(normal, *offset, vector);
                    queue.push(Pending {
                        priority: top.priority.min(m),
                        node: *right,
                    });
                    queue.push(Pending {
                        priority: top.priority.min(-m),
                        node: *left,
                    });
                }
            }
        }

        let mut neighbors: Vec<Neighbor> = candidates
            .into_iter()
            .map(|slot| Neighbor {
                id: self.ids[slot as usize],
                distance: euclidean(&self.points[slot as usize], vector),
            })
            .collect();
        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        neighbors.truncate(k);

        Ok(neighbors)
    }

    /// Up to `k` nearest neighbors of an indexed track, never including the
    /// track itself.
    ///
    /// An id that is not in the index yields no neighbors.
    ///
    /// # Errors
    ///
    /// Internal dimension errors only.
    pub fn query_by_item(&self, id: TrackId, k: usize) -> Result<Vec<Neighbor>> {
        let Some(point) = self.point(id) else {
            warn!("Track {id} is not in the feature index");
            return Ok(Vec::new());
        };

        let mut neighbors = self.query_by_vector(point, k + 1)?;
        neighbors.retain(|n| n.id != id);
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Persist the index, atomically replacing any artifact at `path`.
    ///
    /// # Errors
    ///
    /// Fails if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self).context("Failed to serialize feature index")?;
        write_atomic(path, &bytes)
            .with_context(|| format!("Failed to save feature index to {}", path.display()))?;
        info!("Saved feature index to {}", path.display());
        Ok(())
    }

    /// Load an index saved with [`AnnIndex::save`].
    ///
    /// The artifact is fully validated before it is returned; nothing is
    /// usable after a failure.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing or malformed, or if it was built for a
    /// different number of dimensions than `dimension`.
    pub fn load(path: &Path, dimension: usize) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Feature index not found at {}", path.display()))?;
        let mut index: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Feature index at {} is corrupt", path.display()))?;

        ensure!(
            index.dimension == dimension,
            "Feature index at {} has {} dimensions, expected {dimension}",
            path.display(),
            index.dimension
        );
        index.validate()?;
        index.slots = index
            .ids
            .iter()
            .enumerate()
            .map(|(slot, &id)| (id, slot as u32))
            .collect();

        debug!("Loaded feature index with {} tracks", index.len());
        Ok(index)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.ids.len() == self.points.len(),
            "Index stores {} ids but {} points",
            self.ids.len(),
            self.points.len()
        );
        ensure!(
            self.points.iter().all(|p| p.len() == self.dimension),
            "Index contains points of the wrong dimension"
        );
        let unique: HashSet<_> = self.ids.iter().collect();
        ensure!(unique.len() == self.ids.len(), "Index contains duplicate ids");

        let node_count = self.nodes.len() as u32;
        let slot_count = self.ids.len() as u32;
        ensure!(
            self.roots.iter().all(|&r| r < node_count),
            "Index root out of bounds"
        );
        for node in &self.nodes {
            match node {
                Node::Leaf { items } => {
                    ensure!(items.iter().all(|&s| s < slot_count), "Index leaf out of bounds");
                }
                Node::Split {
                    normal,
                    left,
                    right,
                    ..
                } => {
                    ensure!(normal.len() == self.dimension, "Index split of wrong dimension");
                    ensure!(
                        *left < node_count && *right < node_count,
                        "Index child out of bounds"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Build an index over every track in `store` that has features.
///
/// Tracks without features are skipped with a warning.
///
/// # Errors
///
/// Store failures or invalid build parameters.
pub fn build_from_store<S: FeatureStore + ?Sized>(
    store: &S,
    weights: &WeightVector,
    trees: usize,
) -> Result<AnnIndex> {
    let mut items = Vec::new();
    for id in store.track_ids()? {
        match store.normalized_features(id)? {
            Some(features) => items.push((id, features)),
            None => warn!("No features for track {id}; skipping"),
        }
    }
    debug!("Indexing {} tracks", items.len());
    AnnIndex::build(items, weights, trees)
}

/// Rebuild the index from `store` and atomically replace the artifact at
/// `path`.
///
/// # Errors
///
/// See [`build_from_store`] and [`AnnIndex::save`].
pub fn rebuild_index<S: FeatureStore + ?Sized>(
    store: &S,
    weights: &WeightVector,
    trees: usize,
    path: &Path,
) -> Result<AnnIndex> {
    let index = build_from_store(store, weights, trees)?;
    index.save(path)?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn triangle() -> Vec<(TrackId, NormalizedFeatures)> {
        vec![
            (1, NormalizedFeatures::from(vec![0.0, 0.0])),
            (2, NormalizedFeatures::from(vec![1.0, 0.0])),
            (3, NormalizedFeatures::from(vec![0.0, 1.0])),
        ]
    }

    fn random_points(n: u32, dimension: usize, seed: u64) -> Vec<(TrackId, NormalizedFeatures)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|id| {
                let v: Vec<f64> = (0..dimension).map(|_| rng.gen::<f64>()).collect();
                (id, NormalizedFeatures::from(v))
            })
            .collect()
    }

    #[test]
    fn test_nearest_of_corner_excludes_itself() {
        let index = AnnIndex::build_seeded(triangle(), &WeightVector::uniform(2, 1.0), 3, 7).unwrap();
        let result = index.query_by_item(1, 1).unwrap();

        assert_eq!(result.len(), 1);
        assert!(result[0].id == 2 || result[0].id == 3);
        assert_eq!(result[0].distance, 1.0);
    }

    #[test]
    fn test_weights_are_baked_into_geometry() {
        let weights = WeightVector::new(vec![1.0, 0.0]);
        let index = AnnIndex::build_seeded(triangle(), &weights, 3, 7).unwrap();

        let result = index.query_by_item(1, 2).unwrap();
        assert_eq!(result[0].id, 3, "zero weight makes the second axis inert");
        assert_eq!(result[0].distance, 0.0);
        assert_eq!(index.point(2), Some(&[1.0, 0.0][..]));
    }

    #[test]
    fn test_empty_index_is_queryable() {
        let index = AnnIndex::build(Vec::new(), &WeightVector::uniform(2, 1.0), 5).unwrap();
        assert!(index.is_empty());
        assert!(index.query_by_vector(&[0.5, 0.5], 3).unwrap().is_empty());
        assert!(index.query_by_item(1, 3).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_dimension_vectors_are_skipped() {
        let mut items = triangle();
        items.push((4, NormalizedFeatures::from(vec![1.0, 1.0, 1.0])));
        let index = AnnIndex::build(items, &WeightVector::uniform(2, 1.0), 2).unwrap();
        assert_eq!(index.len(), 3);
        assert!(!index.contains(4));
    }

    #[test]
    fn test_query_results_exclude_self_and_are_sorted() {
        let points = random_points(300, 4, 11);
        let index = AnnIndex::build_seeded(points, &WeightVector::uniform(4, 1.0), 8, 3).unwrap();

        for &id in index.ids() {
            let result = index.query_by_item(id, 5).unwrap();
            assert!(result.len() <= 5);
            assert!(result.iter().all(|n| n.id != id), "track {id} returned as its own neighbor");
            assert!(result.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_recall_against_brute_force() {
        let points = random_points(300, 3, 5);
        let index =
            AnnIndex::build_seeded(points.clone(), &WeightVector::uniform(3, 1.0), 10, 9).unwrap();

        let mut hits = 0;
        for (id, features) in &points {
            let exact = points
                .iter()
                .filter(|(other, _)| other != id)
                .min_by(|a, b| {
                    euclidean(a.1.as_slice(), features.as_slice())
                        .total_cmp(&euclidean(b.1.as_slice(), features.as_slice()))
                })
                .map(|(other, _)| *other)
                .unwrap();
            let found = index.query_by_item(*id, 1).unwrap();
            if found.first().map(|n| n.id) == Some(exact) {
                hits += 1;
            }
        }

        assert!(hits >= 270, "nearest neighbor recall too low: {hits}/300");
    }

    #[test]
    fn test_duplicate_points_still_split() {
        let items: Vec<(TrackId, NormalizedFeatures)> = (0..100)
            .map(|id| (id, NormalizedFeatures::from(vec![0.5, 0.5])))
            .collect();
        let index = AnnIndex::build_seeded(items, &WeightVector::uniform(2, 1.0), 2, 1).unwrap();
        let result = index.query_by_item(0, 10).unwrap();
        assert_eq!(result.len(), 10);
        assert!(result.iter().all(|n| n.distance == 0.0 && n.id != 0));
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("features.idx");
        let index =
            AnnIndex::build_seeded(random_points(50, 3, 2), &WeightVector::uniform(3, 1.0), 4, 2)
                .unwrap();
        index.save(&path).unwrap();

        let loaded = AnnIndex::load(&path, 3).unwrap();
        assert_eq!(loaded.len(), 50);
        for id in [0, 17, 49] {
            assert_eq!(
                loaded.query_by_item(id, 5).unwrap(),
                index.query_by_item(id, 5).unwrap()
            );
        }
    }

    #[test]
    fn test_load_rejects_dimension_mismatch_and_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("features.idx");
        AnnIndex::build(triangle(), &WeightVector::uniform(2, 1.0), 2)
            .unwrap()
            .save(&path)
            .unwrap();

        assert!(AnnIndex::load(&path, 3).is_err());
        assert!(AnnIndex::load(&temp_dir.path().join("missing.idx"), 2).is_err());
    }

    #[test]
    fn test_load_rejects_corrupt_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("features.idx");
        fs::write(&path, b"{\"dimension\": 2, \"ids\": [1]").unwrap();
        assert!(AnnIndex::load(&path, 2).is_err());
    }
}
