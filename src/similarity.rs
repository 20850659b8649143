//! Similarity queries and breadth-first graph expansion.
//!
//! [`SimilarityEngine`] answers "tracks like this one" on top of an
//! [`AnnIndex`]. Distances are turned into scores with
//! `similarity = 1 - distance`. That is a convention, not a bounded metric:
//! far-apart tracks get negative scores and nothing here assumes otherwise.
//!
//! [`SimilarityEngine::expand`] grows a [`SimilarityGraph`] from seed tracks.
//! Each track is expanded at most once, but a track reached from several
//! parents keeps every incoming edge. The walk is breadth-first over an
//! explicit queue, so each track is expanded at its shortest distance from a
//! seed and deep settings cannot overflow the call stack.

use crate::config::SimilarityConfig;
use crate::features::{NormalizedFeatures, TrackId};
use crate::index::AnnIndex;
use crate::store::{FeatureStore, TrackCatalog, TrackInfo};
use crate::weights::WeightVector;
use anyhow::{ensure, Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// A neighbor and its similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Similar {
    pub id: TrackId,
    pub similarity: f64,
}

#[inline]
#[must_use]
pub fn similarity_from_distance(distance: f64) -> f64 {
    1.0 - distance
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Parent to neighbor, found by expansion.
    Traversal,
    /// Between two neighbors of the same track whose mutual similarity is
    /// above the configured threshold.
    Affinity,
}

/// Presentation hints for drawing an edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeStyle {
    pub color: String,
    pub width: f64,
    pub opacity: f64,
}

/// Red for weak edges shading to green for strong ones; thicker and more
/// opaque as similarity grows.
#[must_use]
pub fn edge_style(similarity: f64) -> EdgeStyle {
    let s = similarity.clamp(0.0, 1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scale = (255.0 * s) as u8;
    EdgeStyle {
        color: format!("rgb({}, {}, 200)", 255 - scale, scale),
        width: (s * 4.0).max(1.0),
        opacity: 0.3 + 0.7 * s,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: TrackId,
    /// Depth at which the track was first reached.
    pub depth: usize,
    pub seed: bool,
    /// Catalog metadata, if the catalog knows the track.
    pub track: Option<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub from: TrackId,
    pub to: TrackId,
    pub similarity: f64,
    pub depth: usize,
    pub kind: EdgeKind,
    pub style: EdgeStyle,
}

/// Tracks visited during one expansion and the edges between them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimilarityGraph {
    nodes: BTreeMap<TrackId, GraphNode>,
    edges: Vec<GraphEdge>,
}

impl SimilarityGraph {
    #[must_use]
    pub fn nodes(&self) -> &BTreeMap<TrackId, GraphNode> {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, id: TrackId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn edges_of_kind(&self, kind: EdgeKind) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(move |e| e.kind == kind)
    }

    /// # Errors
    ///
    /// Serialization failures only.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize similarity graph")
    }

    fn edge(&mut self, from: TrackId, to: TrackId, similarity: f64, depth: usize, kind: EdgeKind) {
        self.edges.push(GraphEdge {
            from,
            to,
            similarity,
            depth,
            kind,
            style: edge_style(similarity),
        });
    }
}

/// Result of [`SimilarityEngine::expand`].
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub graph: SimilarityGraph,
    /// File paths of every seed followed by its direct neighbors, in visit
    /// order. A track reached twice appears twice.
    pub playlist: Vec<String>,
}

/// Similarity lookups over a loaded index.
pub struct SimilarityEngine<'s, S: ?Sized> {
    index: AnnIndex,
    weights: WeightVector,
    store: &'s S,
    config: SimilarityConfig,
}

impl<'s, S> SimilarityEngine<'s, S>
where
    S: FeatureStore + TrackCatalog + ?Sized,
{
    /// `weights` must be the vector the index was built with.
    ///
    /// # Errors
    ///
    /// Fails if the weights and index disagree on dimensionality.
    pub fn new(index: AnnIndex, weights: WeightVector, store: &'s S, config: SimilarityConfig) -> Result<Self> {
        ensure!(
            index.dimension() == weights.len(),
            "Index has {} dimensions but {} weights were given",
            index.dimension(),
            weights.len()
        );
        Ok(Self {
            index,
            weights,
            store,
            config,
        })
    }

    #[must_use]
    pub fn index(&self) -> &AnnIndex {
        &self.index
    }

    #[must_use]
    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    #[must_use]
    pub fn store(&self) -> &'s S {
        self.store
    }

    #[must_use]
    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// Up to `k` tracks most similar to `features`, best first, never
    /// including `id` itself.
    ///
    /// # Errors
    ///
    /// Fails if `features` has the wrong dimensionality.
    pub fn find_similar(&self, id: TrackId, features: &NormalizedFeatures, k: usize) -> Result<Vec<Similar>> {
        let query = self.weights.apply(features.as_slice());
        let neighbors = self.index.query_by_vector(&query, k + 1)?;

        Ok(neighbors
            .into_iter()
            .filter(|n| n.id != id)
            .take(k)
            .map(|n| Similar {
                id: n.id,
                similarity: similarity_from_distance(n.distance),
            })
            .collect())
    }

    /// [`SimilarityEngine::find_similar`] for a stored track; `None` if the
    /// track has no features.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn similar_to(&self, id: TrackId, k: usize) -> Result<Option<Vec<Similar>>> {
        match self.store.normalized_features(id)? {
            Some(features) => self.find_similar(id, &features, k).map(Some),
            None => Ok(None),
        }
    }

    /// Expand `seeds` with the configured depth and neighbor count.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn expand(&self, seeds: &[TrackId]) -> Result<Expansion> {
        self.expand_with(seeds, self.config.max_depth, self.config.neighbors)
    }

    /// Breadth-first expansion from every seed.
    ///
    /// All seeds are processed at depth 0 before anything deeper, so a track
    /// is always expanded at its shortest distance from a seed. A track at
    /// depth `d` gets its `k` nearest neighbors as edges; each neighbor is
    /// expanded in turn while `d + 1 < max_depth`. Tracks without features
    /// are skipped.
    ///
    /// Every seed contributes itself and its neighbors to the playlist, even
    /// when it is also a neighbor of an earlier seed.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn expand_with(&self, seeds: &[TrackId], max_depth: usize, k: usize) -> Result<Expansion> {
        let mut expansion = Expansion::default();
        let mut expanded = HashSet::new();
        let mut linked = HashSet::new();
        let mut queue: VecDeque<(TrackId, usize)> = seeds.iter().map(|&seed| (seed, 0)).collect();

        while let Some((track, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let first_visit = expanded.insert(track);
            if !first_visit && depth > 0 {
                continue;
            }

            let Some(neighbors) = self.similar_to(track, k)? else {
                warn!("No features for track {track}; not expanded");
                continue;
            };

            self.visit(&mut expansion.graph, track, depth)?;
            for n in &neighbors {
                self.visit(&mut expansion.graph, n.id, depth + 1)?;
            }

            if depth == 0 {
                self.add_to_playlist(&mut expansion, track);
                for n in &neighbors {
                    self.add_to_playlist(&mut expansion, n.id);
                }
            }

            // A seed listed twice only repeats its playlist entries.
            if !first_visit {
                continue;
            }
            debug!("Expanding track {track} at depth {depth}: {} neighbors", neighbors.len());

            for n in &neighbors {
                expansion
                    .graph
                    .edge(track, n.id, n.similarity, depth, EdgeKind::Traversal);
            }
            self.link_neighbors(&mut expansion.graph, &mut linked, &neighbors, depth);

            if depth + 1 < max_depth {
                queue.extend(neighbors.iter().map(|n| (n.id, depth + 1)));
            }
        }

        Ok(expansion)
    }

    /// Add `id` to the graph if it is new. Depth-0 visits mark seeds.
    fn visit(&self, graph: &mut SimilarityGraph, id: TrackId, depth: usize) -> Result<()> {
        if let Some(node) = graph.nodes.get_mut(&id) {
            node.seed |= depth == 0;
            node.depth = node.depth.min(depth);
            return Ok(());
        }

        let track = self.store.track(id)?;
        graph.nodes.insert(
            id,
            GraphNode {
                id,
                depth,
                seed: depth == 0,
                track,
            },
        );
        Ok(())
    }

    fn add_to_playlist(&self, expansion: &mut Expansion, id: TrackId) {
        match expansion.graph.node(id).and_then(|n| n.track.as_ref()) {
            Some(track) => expansion.playlist.push(track.path.clone()),
            None => warn!("Track {id} is not in the catalog; left out of the playlist"),
        }
    }

    /// Affinity edges between every pair of `neighbors` that are similar
    /// enough to each other. Each pair is linked once per expansion.
    fn link_neighbors(
        &self,
        graph: &mut SimilarityGraph,
        linked: &mut HashSet<(TrackId, TrackId)>,
        neighbors: &[Similar],
        depth: usize,
    ) {
        for (i, a) in neighbors.iter().enumerate() {
            for b in &neighbors[i + 1..] {
                let Some(distance) = self.index.distance(a.id, b.id) else {
                    continue;
                };
                let similarity = similarity_from_distance(distance);
                let pair = (a.id.min(b.id), a.id.max(b.id));
                if similarity > self.config.edge_threshold && linked.insert(pair) {
                    graph.edge(a.id, b.id, similarity, depth, EdgeKind::Affinity);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn track(id: TrackId) -> TrackInfo {
        TrackInfo {
            id,
            title: format!("Song {id}"),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            path: format!("/music/{id}.flac"),
        }
    }

    fn store_of(points: &[(TrackId, Vec<f64>)]) -> MemoryStore {
        let mut store = MemoryStore::new();
        for (id, v) in points {
            store.insert_features(*id, v.clone());
            store.insert_track(track(*id));
        }
        store
    }

    fn engine(store: &MemoryStore, dimension: usize) -> SimilarityEngine<'_, MemoryStore> {
        let weights = WeightVector::uniform(dimension, 1.0);
        let index = AnnIndex::build_seeded(store.features().clone(), &weights, 4, 1).unwrap();
        SimilarityEngine::new(index, weights, store, SimilarityConfig::default()).unwrap()
    }

    #[test]
    fn test_find_similar_scores_and_order() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![0.25]), (3, vec![0.5]), (4, vec![1.5])]);
        let engine = engine(&store, 1);

        let features = store.normalized_features(1).unwrap().unwrap();
        let result = engine.find_similar(1, &features, 3).unwrap();

        let ids: Vec<_> = result.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(result[0].similarity, 0.75);
        assert_eq!(result[1].similarity, 0.5);
        assert_eq!(result[2].similarity, -0.5, "distant tracks may score below zero");
        assert!(result.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[test]
    fn test_expand_depth_one_builds_playlist() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![1.0]), (3, vec![2.0]), (4, vec![3.0])]);
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[1], 1, 2).unwrap();

        assert_eq!(expansion.playlist, vec!["/music/1.flac", "/music/2.flac", "/music/3.flac"]);
        assert_eq!(expansion.graph.nodes().len(), 3);
        assert!(expansion.graph.node(1).unwrap().seed);
        assert_eq!(expansion.graph.node(3).unwrap().depth, 1);

        let traversal: Vec<_> = expansion.graph.edges_of_kind(EdgeKind::Traversal).collect();
        assert_eq!(traversal.len(), 2);
        assert!(traversal.iter().all(|e| e.from == 1 && e.depth == 0));
    }

    #[test]
    fn test_expand_visits_each_track_once_but_keeps_all_parents() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![1.0]), (3, vec![2.0]), (4, vec![3.0])]);
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[1], 3, 2).unwrap();
        let traversal: Vec<_> = expansion.graph.edges_of_kind(EdgeKind::Traversal).collect();

        for id in [1, 2, 3, 4] {
            let outgoing = traversal.iter().filter(|e| e.from == id).count();
            assert_eq!(outgoing, 2, "track {id} must be expanded exactly once");
        }

        let parents_of_3: HashSet<_> = traversal.iter().filter(|e| e.to == 3).map(|e| e.from).collect();
        assert_eq!(parents_of_3, HashSet::from([1, 2, 4]));

        // Only the seed's own neighborhood is exported.
        assert_eq!(expansion.playlist.len(), 3);
    }

    #[test]
    fn test_expand_reaches_every_track_within_depth() {
        // Track 3 is a direct neighbor of the seed and also reachable via 2.
        let store = store_of(&[
            (1, vec![0.0]),
            (2, vec![1.0]),
            (3, vec![1.1]),
            (4, vec![2.0]),
            (5, vec![2.8]),
            (6, vec![4.0]),
        ]);
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[1], 3, 2).unwrap();

        let nodes: Vec<_> = expansion.graph.nodes().keys().copied().collect();
        assert_eq!(nodes, vec![1, 2, 3, 4, 5]);
        assert_eq!(expansion.graph.node(3).unwrap().depth, 1);
        assert_eq!(expansion.graph.node(5).unwrap().depth, 3);

        let from_3: Vec<_> = expansion
            .graph
            .edges_of_kind(EdgeKind::Traversal)
            .filter(|e| e.from == 3)
            .collect();
        assert_eq!(from_3.len(), 2);
        assert!(from_3.iter().all(|e| e.depth == 1), "track 3 expanded at its shortest depth");
    }

    #[test]
    fn test_every_seed_is_expanded_at_depth_zero() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![1.0]), (3, vec![1.5])]);
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[1, 2], 2, 1).unwrap();

        assert_eq!(
            expansion.playlist,
            vec!["/music/1.flac", "/music/2.flac", "/music/2.flac", "/music/3.flac"]
        );
        let seed = expansion.graph.node(2).unwrap();
        assert!(seed.seed);
        assert_eq!(seed.depth, 0);

        let from_2: Vec<_> = expansion
            .graph
            .edges_of_kind(EdgeKind::Traversal)
            .filter(|e| e.from == 2)
            .map(|e| (e.to, e.depth))
            .collect();
        assert_eq!(from_2, vec![(3, 0)]);
    }

    #[test]
    fn test_repeated_seed_repeats_playlist_only() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![1.0])]);
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[1, 1], 1, 1).unwrap();

        assert_eq!(
            expansion.playlist,
            vec!["/music/1.flac", "/music/2.flac", "/music/1.flac", "/music/2.flac"]
        );
        assert_eq!(expansion.graph.edges_of_kind(EdgeKind::Traversal).count(), 1);
    }

    #[test]
    fn test_affinity_edges_above_threshold() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![0.25]), (3, vec![0.5]), (4, vec![5.0])]);
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[1], 1, 2).unwrap();
        let affinity: Vec<_> = expansion.graph.edges_of_kind(EdgeKind::Affinity).collect();

        assert_eq!(affinity.len(), 1);
        assert_eq!((affinity[0].from, affinity[0].to), (2, 3));
        assert_eq!(affinity[0].similarity, 0.75);
    }

    #[test]
    fn test_seed_without_features_is_skipped() {
        let mut store = store_of(&[(1, vec![0.0]), (2, vec![1.0])]);
        store.insert_track(track(9));
        let engine = engine(&store, 1);

        let expansion = engine.expand_with(&[9, 1], 1, 1).unwrap();
        assert!(expansion.graph.node(9).is_none());
        assert_eq!(expansion.playlist, vec!["/music/1.flac", "/music/2.flac"]);
    }

    #[test]
    fn test_zero_depth_expands_nothing() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![1.0])]);
        let engine = engine(&store, 1);
        let expansion = engine.expand_with(&[1], 0, 5).unwrap();
        assert!(expansion.graph.nodes().is_empty());
        assert!(expansion.playlist.is_empty());
    }

    #[test]
    fn test_edge_style_bounds() {
        let strong = edge_style(1.0);
        assert_eq!(strong.color, "rgb(0, 255, 200)");
        assert_eq!(strong.width, 4.0);
        assert_eq!(strong.opacity, 1.0);

        let weak = edge_style(-2.0);
        assert_eq!(weak.color, "rgb(255, 0, 200)");
        assert_eq!(weak.width, 1.0);
        assert!((weak.opacity - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_graph_serializes() {
        let store = store_of(&[(1, vec![0.0]), (2, vec![1.0])]);
        let engine = engine(&store, 1);
        let json = engine.expand_with(&[1], 1, 1).unwrap().graph.to_json().unwrap();
        assert!(json.contains("\"traversal\""));
        assert!(json.contains("/music/2.flac"));
    }
}
