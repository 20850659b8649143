//! Content-based music similarity with feedback-trained feature weights.
//!
//! Core modules:
//! - [`features`] - Feature schema and min-max normalization
//! - [`weights`] - Clamped weight vectors and their persistence
//! - [`index`] - Approximate nearest-neighbor index (random projection forest)
//! - [`similarity`] - Similarity queries and graph expansion
//! - [`trainer`] - Gradient descent over the weights from user ratings
//! - [`feedback`] - Rating sessions around the trainer
//!
//! ### Supporting Modules
//!
//! - [`store`] - Feature store and catalog traits, in-memory implementation
//! - [`db`] - SQLite catalog, precompute and search
//! - [`bulk`] - Exhaustive parallel all-pairs similarity
//! - [`playlist`] - M3U export
//! - [`config`] - Configuration and data directory management
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```
//! use echoes::config::SimilarityConfig;
//! use echoes::index::build_from_store;
//! use echoes::similarity::SimilarityEngine;
//! use echoes::store::MemoryStore;
//! use echoes::weights::WeightVector;
//! use std::collections::BTreeMap;
//!
//! // Raw analysis output, normalized against the catalog extremes
//! let raw = BTreeMap::from([
//!     (1, vec![120.0, 0.8]),
//!     (2, vec![124.0, 0.7]),
//!     (3, vec![60.0, 0.1]),
//! ]);
//! let store = MemoryStore::from_raw(&raw)?;
//!
//! let weights = WeightVector::uniform(2, 1.0);
//! let index = build_from_store(&store, &weights, 10)?;
//! let engine = SimilarityEngine::new(index, weights, &store, SimilarityConfig::default())?;
//!
//! let similar = engine.similar_to(1, 1)?.unwrap_or_default();
//! assert_eq!(similar[0].id, 2);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Similarity
//!
//! Tracks are points in a weighted feature space. Every feature is scaled to
//! `[0, 1]` across the catalog, multiplied by its weight, and compared with
//! Euclidean distance. Scores are reported as `1 - distance`, which is not
//! bounded: distant tracks score below zero.
//!
//! ## Training
//!
//! Rating the neighbors of a track (1 to 5) nudges their target similarity by
//! `rating * adjustment_factor`. The trainer fits the weights to those targets
//! with per-sample gradient descent, early stopping and learning-rate decay.
//! Confirmed weights are written back to the configuration and the index is
//! rebuilt and swapped in atomically.
//!
//! ## Error Handling
//!
//! All fallible public functions return `anyhow::Result`. A track without
//! features is `Ok(None)` and is skipped wherever it shows up; a missing or
//! mismatched index is an error.

pub mod bulk;
pub mod cli;
pub mod completion;
pub mod config;
pub mod db;
pub mod features;
pub mod feedback;
pub mod index;
pub mod playlist;
pub mod similarity;
pub mod store;
pub mod trainer;
pub mod weights;
