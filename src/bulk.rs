//! Exhaustive all-pairs similarity.
//!
//! Unlike the ANN index this compares every track with every other one, using
//! cosine similarity on the normalized vectors. Tracks are split into batches
//! that rayon processes in parallel. Workers share nothing but the progress
//! reporter.

use crate::config::BulkConfig;
use crate::features::{NormalizedFeatures, TrackId};
use anyhow::{ensure, Result};
use log::info;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A stored pair; `first < second` always holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarPair {
    pub first: TrackId,
    pub second: TrackId,
    pub similarity: f64,
}

/// `a . b / (|a| |b|)`, or 0.0 when either vector is all zeros.
#[must_use]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Told once per finished batch, from any worker thread.
pub trait BatchProgress: Sync {
    fn batch_done(&self, total: usize);
}

/// Counts finished batches and logs each one.
#[derive(Debug, Default)]
pub struct AtomicProgress {
    completed: AtomicUsize,
}

impl AtomicProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

impl BatchProgress for AtomicProgress {
    fn batch_done(&self, total: usize) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Progress: {done}/{total} batches completed");
    }
}

/// Every pair scoring at least `config.threshold`, keeping the best
/// `config.top_n` partners per track.
///
/// Each track is only compared with tracks of a larger id, so every pair is
/// produced once. The result is ordered by the first id, then by descending
/// similarity.
///
/// # Errors
///
/// Fails if the vectors disagree on dimensionality or the batch size is zero.
pub fn compute_all_pairs(
    tracks: &[(TrackId, NormalizedFeatures)],
    config: &BulkConfig,
    progress: &dyn BatchProgress,
) -> Result<Vec<SimilarPair>> {
    ensure!(config.batch_size > 0, "Batch size must be positive");
    if let Some((_, first)) = tracks.first() {
        ensure!(
            tracks.iter().all(|(_, v)| v.len() == first.len()),
            "Feature vectors have different lengths"
        );
    }

    let mut sorted: Vec<&(TrackId, NormalizedFeatures)> = tracks.iter().collect();
    sorted.sort_by_key(|entry| entry.0);
    sorted.dedup_by_key(|entry| entry.0);

    let batches = sorted.len().div_ceil(config.batch_size);
    info!(
        "Comparing {} tracks in {batches} batches of {}",
        sorted.len(),
        config.batch_size
    );

    let per_batch: Vec<Vec<SimilarPair>> = (0..batches)
        .into_par_iter()
        .map(|batch| {
            let start = batch * config.batch_size;
            let end = (start + config.batch_size).min(sorted.len());

            let mut pairs = Vec::new();
            for i in start..end {
                let (id, features) = sorted[i];
                let mut best: Vec<SimilarPair> = sorted[i + 1..]
                    .iter()
                    .map(|(other, other_features)| SimilarPair {
                        first: *id,
                        second: *other,
                        similarity: cosine_similarity(features.as_slice(), other_features.as_slice()),
                    })
                    .filter(|p| p.similarity >= config.threshold)
                    .collect();
                best.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
                best.truncate(config.top_n);
                pairs.extend(best);
            }

            progress.batch_done(batches);
            pairs
        })
        .collect();

    Ok(per_batch.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks(vectors: &[(TrackId, [f64; 2])]) -> Vec<(TrackId, NormalizedFeatures)> {
        vectors
            .iter()
            .map(|(id, v)| (*id, NormalizedFeatures::from(v.to_vec())))
            .collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_pairs_above_threshold_once_each() {
        let input = tracks(&[
            (3, [1.0, 0.0]),
            (1, [1.0, 0.1]),
            (2, [0.0, 1.0]),
            (4, [1.0, 0.5]),
        ]);
        let config = BulkConfig {
            batch_size: 1,
            threshold: 0.8,
            top_n: 10,
        };
        let progress = AtomicProgress::new();

        let pairs = compute_all_pairs(&input, &config, &progress).unwrap();

        assert_eq!(progress.completed(), 4);
        assert!(pairs.iter().all(|p| p.first < p.second && p.similarity >= 0.8));
        let ids: Vec<_> = pairs.iter().map(|p| (p.first, p.second)).collect();
        assert_eq!(ids, vec![(1, 3), (1, 4), (3, 4)]);
    }

    #[test]
    fn test_top_n_per_track() {
        let input = tracks(&[(1, [1.0, 0.0]), (2, [1.0, 0.2]), (3, [1.0, 0.1]), (4, [1.0, 0.3])]);
        let config = BulkConfig {
            batch_size: 2,
            threshold: 0.0,
            top_n: 1,
        };

        let pairs = compute_all_pairs(&input, &config, &AtomicProgress::new()).unwrap();
        let ids: Vec<_> = pairs.iter().map(|p| (p.first, p.second)).collect();
        assert_eq!(ids, vec![(1, 3), (2, 4), (3, 4)]);
    }

    #[test]
    fn test_empty_and_invalid_input() {
        let config = BulkConfig::default();
        assert!(compute_all_pairs(&[], &config, &AtomicProgress::new())
            .unwrap()
            .is_empty());

        let mixed = vec![
            (1, NormalizedFeatures::from(vec![1.0])),
            (2, NormalizedFeatures::from(vec![1.0, 0.0])),
        ];
        assert!(compute_all_pairs(&mixed, &config, &AtomicProgress::new()).is_err());
    }
}
